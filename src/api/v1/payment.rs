use axum::{
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use bson::oid::ObjectId;
use mongodb::options::FindOptions;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::OffsetDateTime;

use crate::{
    app::start_transaction,
    error::Error,
    mongo_ext::Collection,
    stripe::StripeClient,
    util::{DecimalString, FormattedDateTime, ObjectIdString},
};

use super::{
    auth::{require_owned_email, SessionUser},
    parcel::{EmailQuery, ParcelCollection, PaymentStatus},
};

#[derive(Clone)]
pub struct PaymentCollection(pub Collection<PaymentModel>);

impl std::ops::Deref for PaymentCollection {
    type Target = Collection<PaymentModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Immutable record of a completed payment. `paid_at` is stored twice, as a
/// native datetime and as RFC 3339 text, matching what existing consumers
/// read.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PaymentModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub parcel_id: ObjectId,
    pub email: String,
    pub amount: Decimal,
    pub transaction_id: String,
    pub payment_method: String,

    pub paid_at: bson::DateTime,
    pub paid_at_string: FormattedDateTime,

    #[serde(flatten)]
    pub card: bson::Document,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Payment {
    pub id: ObjectIdString,

    pub parcel_id: ObjectIdString,
    pub email: String,
    pub amount: Decimal,
    pub transaction_id: String,
    pub payment_method: String,

    pub paid_at: FormattedDateTime,

    #[serde(flatten)]
    pub card: bson::Document,
}

impl From<PaymentModel> for Payment {
    fn from(value: PaymentModel) -> Self {
        Self {
            id: value.id.into(),

            parcel_id: value.parcel_id.into(),
            email: value.email,
            amount: value.amount,
            transaction_id: value.transaction_id,
            payment_method: value.payment_method,

            paid_at: value.paid_at.into(),

            card: value.card,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecordPaymentRequest {
    #[serde(default, alias = "parcelId")]
    pub parcel_id: Option<ObjectIdString>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub amount: Option<DecimalString>,

    #[serde(default, alias = "transactionId")]
    pub transaction_id: Option<String>,

    #[serde(default, alias = "paymentMethod")]
    pub payment_method: Option<String>,

    #[serde(flatten)]
    pub card: bson::Document,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecordPaymentResponse {
    pub inserted_id: ObjectIdString,
}

/// Marks the parcel paid and inserts the payment record in one transaction.
/// The paid flag is flipped with a guarded update so a concurrent duplicate
/// submission cannot produce a second record.
#[tracing::instrument(skip_all)]
pub async fn record(
    State(parcels): State<ParcelCollection>,
    State(payments): State<PaymentCollection>,
    State(mongo): State<mongodb::Client>,
    request: Result<Json<RecordPaymentRequest>, JsonRejection>,
) -> Result<Json<RecordPaymentResponse>, Error> {
    let Json(request) = request?;

    let (Some(parcel_id), Some(email), Some(amount), Some(transaction_id), Some(payment_method)) = (
        request.parcel_id,
        request.email,
        request.amount,
        request.transaction_id,
        request.payment_method,
    ) else {
        return Err(Error::BadRequest(
            "parcelId, email, amount, transactionId and paymentMethod are required",
        ));
    };

    let parcel = parcels
        .find_one_by_id(*parcel_id)
        .await?
        .ok_or(Error::NoResource)
        .tap_err(|_| tracing::debug!("tried paying non existing parcel"))?;

    if parcel.payment_status == PaymentStatus::Paid {
        return Err(Error::BadRequest("Parcel is already paid"));
    }

    let now = OffsetDateTime::now_utc();

    let model = PaymentModel {
        id: ObjectId::new(),

        parcel_id: *parcel_id,
        email,
        amount: amount.into(),
        transaction_id: transaction_id.clone(),
        payment_method: payment_method.clone(),

        paid_at: now.into(),
        paid_at_string: now.into(),

        card: request.card,
    };

    let mut session = start_transaction(&mongo).await?;

    let result = parcels
        .update_one_with_session(
            bson::doc! {
                "_id": *parcel_id,
                "payment_status": PaymentStatus::Unpaid,
            },
            bson::doc! {
                "$set": {
                    "payment_status": PaymentStatus::Paid,
                    "transaction_id": &transaction_id,
                    "payment_method": &payment_method,
                }
            },
            None,
            &mut session,
        )
        .await?;

    if result.matched_count == 0 {
        session.abort_transaction().await?;
        return Err(Error::BadRequest("Parcel is already paid"));
    }

    payments
        .insert_one_with_session(&model, None, &mut session)
        .await?;

    session.commit_transaction().await?;

    Ok(Json(RecordPaymentResponse {
        inserted_id: model.id.into(),
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PaymentListResponse {
    pub payments: Vec<Payment>,
}

pub async fn my_payments(
    State(payments): State<PaymentCollection>,
    session: SessionUser,
    Query(query): Query<EmailQuery>,
) -> Result<Json<PaymentListResponse>, Error> {
    if let Some(email) = &query.email {
        require_owned_email(&session.email, email)?;
    }

    let options = FindOptions::builder()
        .sort(bson::doc! { "paid_at": -1 })
        .build();

    let mut cursor = payments
        .find(bson::doc! { "email": &session.email }, options)
        .await?;

    let mut result = vec![];

    while cursor.advance().await? {
        let payment = cursor.deserialize_current()?;

        result.push(payment.into());
    }

    Ok(Json(PaymentListResponse { payments: result }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateIntentRequest {
    #[serde(default)]
    pub amount: Option<DecimalString>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateIntentResponse {
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
}

/// Major currency units to the gateway's smallest unit.
fn to_minor_units(amount: Decimal) -> Result<i64, Error> {
    if amount <= Decimal::ZERO {
        return Err(Error::BadRequest("amount must be positive"));
    }

    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or(Error::BadRequest("amount is too large"))
}

pub async fn create_payment_intent(
    State(stripe): State<StripeClient>,
    request: Result<Json<CreateIntentRequest>, JsonRejection>,
) -> Result<Json<CreateIntentResponse>, Error> {
    let Json(request) = request?;

    let amount = request
        .amount
        .ok_or(Error::BadRequest("amount is required"))?;

    let client_secret = stripe
        .create_payment_intent(to_minor_units(amount.into())?)
        .await?;

    Ok(Json(CreateIntentResponse { client_secret }))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::Json;
    use rust_decimal::Decimal;

    use crate::{api::v1::tests::bootstrap, error::Error, util::DecimalString};

    fn record_request(
        parcel_id: bson::oid::ObjectId,
        transaction_id: &str,
    ) -> super::RecordPaymentRequest {
        super::RecordPaymentRequest {
            parcel_id: Some(parcel_id.into()),
            email: Some("a@x.com".to_string()),
            amount: Some(DecimalString(Decimal::from(500))),
            transaction_id: Some(transaction_id.to_string()),
            payment_method: Some("card".to_string()),
            card: bson::doc! { "card_brand": "visa" },
        }
    }

    #[test]
    fn test_to_minor_units() {
        assert_eq!(super::to_minor_units(Decimal::from(5)).unwrap(), 500);
        assert_eq!(
            super::to_minor_units(Decimal::from_str_exact("5.5").unwrap()).unwrap(),
            550
        );

        assert_matches!(
            super::to_minor_units(Decimal::ZERO).unwrap_err(),
            Error::BadRequest(_)
        );
        assert_matches!(
            super::to_minor_units(Decimal::from(-3)).unwrap_err(),
            Error::BadRequest(_)
        );
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_record_missing_fields() {
        let bootstrap = bootstrap().await;

        let mut request = record_request(bson::oid::ObjectId::new(), "tx1");
        request.amount = None;

        let error = super::record(
            bootstrap.parcels(),
            bootstrap.payments(),
            bootstrap.mongo(),
            Ok(Json(request)),
        )
        .await
        .unwrap_err();
        assert_matches!(error, Error::BadRequest(_));
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_record_unknown_parcel() {
        let bootstrap = bootstrap().await;

        let error = super::record(
            bootstrap.parcels(),
            bootstrap.payments(),
            bootstrap.mongo(),
            Ok(Json(record_request(bson::oid::ObjectId::new(), "tx1"))),
        )
        .await
        .unwrap_err();
        assert_matches!(error, Error::NoResource);
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_record_pays_exactly_once() {
        let bootstrap = bootstrap().await;

        let parcel = bootstrap.create_parcel("a@x.com").await;

        let _ = super::record(
            bootstrap.parcels(),
            bootstrap.payments(),
            bootstrap.mongo(),
            Ok(Json(record_request(*parcel.id, "tx1"))),
        )
        .await
        .unwrap();

        let stored = bootstrap
            .app_state
            .parcel_collection
            .find_one_by_id(*parcel.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.payment_status, super::PaymentStatus::Paid);
        assert_eq!(stored.transaction_id.as_deref(), Some("tx1"));

        let error = super::record(
            bootstrap.parcels(),
            bootstrap.payments(),
            bootstrap.mongo(),
            Ok(Json(record_request(*parcel.id, "tx2"))),
        )
        .await
        .unwrap_err();
        assert_matches!(error, Error::BadRequest("Parcel is already paid"));

        let count = bootstrap
            .app_state
            .payment_collection
            .count_documents(bson::doc! { "parcel_id": *parcel.id }, None)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_my_payments_ownership() {
        let bootstrap = bootstrap().await;

        let error = super::my_payments(
            bootstrap.payments(),
            bootstrap.session_for("alice@x.com"),
            axum::extract::Query(crate::api::v1::parcel::EmailQuery {
                email: Some("bob@x.com".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(error, Error::Forbidden);
    }
}
