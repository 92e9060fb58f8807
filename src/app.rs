use axum::extract::FromRef;
use mongodb::ClientSession;

use crate::{
    api::v1::{
        auth::JwtState, parcel::ParcelCollection, payment::PaymentCollection,
        rider::RiderCollection, user::UserCollection,
    },
    error::Error,
    migrate::MigrationCollection,
    stripe::StripeClient,
};

/// How state-machine endpoints treat writes that do not follow the normal
/// forward order. `Strict` rejects them with a conflict; `Lenient` keeps the
/// legacy behavior of writing unconditionally (re-assignment at any stage,
/// cashout confirmation without a request).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransitionPolicy {
    #[default]
    Strict,
    Lenient,
}

impl TransitionPolicy {
    pub fn is_strict(self) -> bool {
        matches!(self, Self::Strict)
    }

    pub fn new_from_env() -> Self {
        match std::env::var("TRANSITION_POLICY").as_deref() {
            Ok("lenient") => Self::Lenient,
            _ => Self::Strict,
        }
    }
}

#[derive(FromRef, Clone)]
pub struct AppState {
    pub jwt_state: JwtState,
    pub policy: TransitionPolicy,
    pub stripe: StripeClient,

    pub mongo_client: mongodb::Client,
    pub migrate_collection: MigrationCollection,
    pub user_collection: UserCollection,
    pub parcel_collection: ParcelCollection,
    pub rider_collection: RiderCollection,
    pub payment_collection: PaymentCollection,
}

impl AppState {
    pub async fn new(
        mongo_url: &str,
        database_name: &str,
        jwt_state: JwtState,
        policy: TransitionPolicy,
        stripe: StripeClient,
    ) -> Result<Self, Error> {
        let mongo_client_opt = mongodb::options::ClientOptions::parse(mongo_url).await?;
        let mongo_client = mongodb::Client::with_options(mongo_client_opt)?;

        let db = mongo_client.database(database_name);
        Ok(Self {
            jwt_state,
            policy,
            stripe,

            mongo_client,
            migrate_collection: MigrationCollection(db.collection("migrations").into()),
            user_collection: UserCollection(db.collection("users").into()),
            parcel_collection: ParcelCollection(db.collection("parcels").into()),
            rider_collection: RiderCollection(db.collection("riders").into()),
            payment_collection: PaymentCollection(db.collection("payments").into()),
        })
    }

    pub async fn new_from_env() -> Result<Self, Error> {
        let mongo_url = std::env::var("MONGODB_URI")
            .expect("Missing required environment variable: MONGODB_URI");
        let database_name =
            std::env::var("DATABASE_NAME").unwrap_or_else(|_| "rapid-parcel".to_string());

        Self::new(
            &mongo_url,
            &database_name,
            JwtState::new_from_env(),
            TransitionPolicy::new_from_env(),
            StripeClient::new_from_env(),
        )
        .await
    }
}

/// Opens a session with a transaction started. Multi-document mutations
/// (payment record + parcel flag, rider approval + role promotion) commit
/// through one of these so neither write can land without the other.
pub async fn start_transaction(client: &mongodb::Client) -> Result<ClientSession, Error> {
    let mut session = client.start_session(None).await?;

    let transaction_options = mongodb::options::TransactionOptions::builder()
        .read_concern(mongodb::options::ReadConcern::snapshot())
        .write_concern(
            mongodb::options::WriteConcern::builder()
                .w(mongodb::options::Acknowledgment::Majority)
                .build(),
        )
        .selection_criteria(mongodb::options::SelectionCriteria::ReadPreference(
            mongodb::options::ReadPreference::Primary,
        ))
        .build();

    session.start_transaction(transaction_options).await?;

    Ok(session)
}
