use std::net::SocketAddr;

use axum::{routing, Router};
use rapid_parcel::api::v1::{auth, cashout, parcel, payment, rider, user};
use rapid_parcel::app::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "rapid_parcel=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app_state = AppState::new_from_env().await.unwrap();
    app_state.run_migration().await.unwrap();

    let app = Router::new()
        .route("/", routing::get(root))
        .route("/validation", routing::post(auth::validation))
        .route("/logout", routing::post(auth::logout))
        .route("/users", routing::post(user::upsert))
        .route("/users/role/:email", routing::get(user::role))
        .route("/users/search", routing::get(user::search))
        .route("/users/:id/role", routing::patch(user::set_role))
        .route("/riders", routing::post(rider::apply))
        .route("/riders/pending", routing::get(rider::pending))
        .route("/riders/active", routing::get(rider::active))
        .route("/riders/:id", routing::patch(rider::set_status))
        .route(
            "/parcels",
            routing::get(parcel::index).post(parcel::create),
        )
        .route("/parcels/assignable", routing::get(parcel::assignable))
        .route(
            "/parcels/:id",
            routing::get(parcel::show).delete(parcel::delete),
        )
        .route("/parcels/:id/assign", routing::patch(parcel::assign))
        .route("/parcels/:id/status", routing::patch(parcel::update_status))
        .route("/rider/tasks", routing::get(parcel::rider_tasks))
        .route(
            "/rider/completed-parcels",
            routing::get(parcel::completed_parcels),
        )
        .route(
            "/rider/cashOut/:parcelId",
            routing::patch(cashout::request_cashout),
        )
        .route("/admin/cashouts", routing::get(cashout::list_cashouts))
        .route(
            "/admin/cashOut/:parcelId",
            routing::patch(cashout::confirm_cashout),
        )
        .route("/payments", routing::post(payment::record))
        .route("/myPayments", routing::get(payment::my_payments))
        .route(
            "/create-payment-intent",
            routing::post(payment::create_payment_intent),
        )
        .with_state(app_state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::very_permissive());

    let port = std::env::var("PORT")
        .ok()
        .and_then(|it| it.parse().ok())
        .unwrap_or(8080u16);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::debug!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .unwrap();
}

async fn root() -> &'static str {
    "Rapid Parcel server is running"
}
