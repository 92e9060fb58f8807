use std::str::FromStr;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    Json,
};
use bson::oid::ObjectId;
use mongodb::options::FindOptions;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::OffsetDateTime;

use crate::{
    app::TransitionPolicy,
    error::Error,
    mongo_ext::Collection,
    util::{FormattedDateTime, ObjectIdString},
};

use super::auth::{require_owned_email, AdminAccess, RiderAccess, SessionUser};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Paid => "paid",
        }
    }
}

impl From<PaymentStatus> for bson::Bson {
    fn from(value: PaymentStatus) -> Self {
        bson::Bson::String(value.as_str().to_string())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Assigned,
    InTransit,
    Delivered,
    ServiceCenterDelivered,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
            Self::ServiceCenterDelivered => "service_center_delivered",
        }
    }

    /// Terminal states in which the rider has finished the delivery.
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Delivered | Self::ServiceCenterDelivered)
    }

    /// Forward-only movement along
    /// pending -> assigned -> in_transit -> {delivered | service_center_delivered}.
    pub fn may_advance_to(self, next: DeliveryStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Assigned)
                | (Self::Assigned, Self::InTransit)
                | (Self::InTransit, Self::Delivered)
                | (Self::InTransit, Self::ServiceCenterDelivered)
        )
    }
}

impl From<DeliveryStatus> for bson::Bson {
    fn from(value: DeliveryStatus) -> Self {
        bson::Bson::String(value.as_str().to_string())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CashoutStatus {
    #[default]
    None,
    Requested,
    Paid,
}

impl CashoutStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Requested => "requested",
            Self::Paid => "paid",
        }
    }
}

impl From<CashoutStatus> for bson::Bson {
    fn from(value: CashoutStatus) -> Self {
        bson::Bson::String(value.as_str().to_string())
    }
}

#[derive(Clone)]
pub struct ParcelCollection(pub Collection<ParcelModel>);

impl std::ops::Deref for ParcelCollection {
    type Target = Collection<ParcelModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The lifecycle fields are typed; everything else the sender supplied at
/// creation (parcel type, weight, addresses, cost...) rides along in
/// `details` untouched.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ParcelModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub sender_email: String,
    pub payment_status: PaymentStatus,
    pub delivery_status: DeliveryStatus,

    #[serde(default)]
    pub assigned_rider_email: Option<String>,
    #[serde(default)]
    pub assigned_rider_name: Option<String>,

    #[serde(default)]
    pub cashout_status: CashoutStatus,
    #[serde(default)]
    pub rider_earned: Option<Decimal>,

    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,

    pub creation_date: bson::DateTime,
    #[serde(default)]
    pub cashout_requested_at: Option<bson::DateTime>,
    #[serde(default)]
    pub cashout_paid_at: Option<bson::DateTime>,
    #[serde(default)]
    pub cashout_confirmed_by: Option<String>,

    #[serde(flatten)]
    pub details: bson::Document,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Parcel {
    pub id: ObjectIdString,

    pub sender_email: String,
    pub payment_status: PaymentStatus,
    pub delivery_status: DeliveryStatus,

    pub assigned_rider_email: Option<String>,
    pub assigned_rider_name: Option<String>,

    pub cashout_status: CashoutStatus,
    pub rider_earned: Option<Decimal>,

    pub transaction_id: Option<String>,
    pub payment_method: Option<String>,

    pub creation_date: FormattedDateTime,
    pub cashout_requested_at: Option<FormattedDateTime>,
    pub cashout_paid_at: Option<FormattedDateTime>,
    pub cashout_confirmed_by: Option<String>,

    #[serde(flatten)]
    pub details: bson::Document,
}

impl From<ParcelModel> for Parcel {
    fn from(value: ParcelModel) -> Self {
        Self {
            id: value.id.into(),

            sender_email: value.sender_email,
            payment_status: value.payment_status,
            delivery_status: value.delivery_status,

            assigned_rider_email: value.assigned_rider_email,
            assigned_rider_name: value.assigned_rider_name,

            cashout_status: value.cashout_status,
            rider_earned: value.rider_earned,

            transaction_id: value.transaction_id,
            payment_method: value.payment_method,

            creation_date: value.creation_date.into(),
            cashout_requested_at: value.cashout_requested_at.map(Into::into),
            cashout_paid_at: value.cashout_paid_at.map(Into::into),
            cashout_confirmed_by: value.cashout_confirmed_by,

            details: value.details,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ParcelListResponse {
    pub parcels: Vec<Parcel>,
}

async fn collect_sorted(
    parcels: &ParcelCollection,
    filter: impl Into<Option<bson::Document>>,
    sort: bson::Document,
) -> Result<Vec<Parcel>, Error> {
    let options = FindOptions::builder().sort(sort).build();

    let mut cursor = parcels.find(filter, options).await?;

    let mut result = vec![];

    while cursor.advance().await? {
        let parcel = cursor.deserialize_current()?;

        result.push(parcel.into());
    }

    Ok(result)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EmailQuery {
    #[serde(default)]
    pub email: Option<String>,
}

pub async fn index(
    State(parcels): State<ParcelCollection>,
    session: SessionUser,
    Query(query): Query<EmailQuery>,
) -> Result<Json<ParcelListResponse>, Error> {
    let filter = match &query.email {
        Some(email) => {
            require_owned_email(&session.email, email)?;
            Some(bson::doc! { "sender_email": email })
        }
        None => None,
    };

    let parcels = collect_sorted(&parcels, filter, bson::doc! { "creation_date": -1 }).await?;

    Ok(Json(ParcelListResponse { parcels }))
}

/// Paid-for parcels still waiting for a rider; the admin assignment pool.
pub async fn assignable(
    State(parcels): State<ParcelCollection>,
    _admin: AdminAccess,
) -> Result<Json<ParcelListResponse>, Error> {
    let filter = bson::doc! {
        "payment_status": PaymentStatus::Paid,
        "delivery_status": DeliveryStatus::Pending,
    };

    let parcels = collect_sorted(&parcels, filter, bson::doc! { "creation_date": -1 }).await?;

    Ok(Json(ParcelListResponse { parcels }))
}

pub async fn show(
    State(parcels): State<ParcelCollection>,
    Path(parcel_id): Path<String>,
) -> Result<Json<Parcel>, Error> {
    let parcel_id = ObjectId::from_str(&parcel_id)
        .map_err(|_| Error::NoResource)
        .tap_err(|_| tracing::debug!("tried accessing non existing parcel"))?;

    let parcel = parcels
        .find_one_by_id(parcel_id)
        .await?
        .ok_or(Error::NoResource)?;

    Ok(Json(parcel.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateParcelRequest {
    #[serde(alias = "senderEmail")]
    pub sender_email: String,

    #[serde(flatten)]
    pub details: bson::Document,
}

pub async fn create(
    State(parcels): State<ParcelCollection>,
    request: Result<Json<CreateParcelRequest>, JsonRejection>,
) -> Result<Json<Parcel>, Error> {
    let Json(request) = request?;

    let model = ParcelModel {
        id: ObjectId::new(),

        sender_email: request.sender_email,
        payment_status: PaymentStatus::Unpaid,
        delivery_status: DeliveryStatus::Pending,

        assigned_rider_email: None,
        assigned_rider_name: None,

        cashout_status: CashoutStatus::default(),
        rider_earned: None,

        transaction_id: None,
        payment_method: None,

        creation_date: OffsetDateTime::now_utc().into(),
        cashout_requested_at: None,
        cashout_paid_at: None,
        cashout_confirmed_by: None,

        details: request.details,
    };

    parcels.insert_one(&model, None).await?;

    Ok(Json(model.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeleteParcelResponse {
    pub deleted_count: u64,
}

pub async fn delete(
    State(parcels): State<ParcelCollection>,
    Path(parcel_id): Path<String>,
) -> Result<Json<DeleteParcelResponse>, Error> {
    let parcel_id = ObjectId::from_str(&parcel_id).map_err(|_| Error::NoResource)?;

    let result = parcels.delete_one_by_id(parcel_id).await?;

    Ok(Json(DeleteParcelResponse {
        deleted_count: result.deleted_count,
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AssignRiderRequest {
    #[serde(default, alias = "riderEmail")]
    pub rider_email: Option<String>,
    #[serde(default, alias = "riderName")]
    pub rider_name: Option<String>,
}

#[tracing::instrument(
    skip_all,
    fields(
        id = %parcel_id,
        admin = %admin.email,
    )
)]
pub async fn assign(
    State(parcels): State<ParcelCollection>,
    State(policy): State<TransitionPolicy>,
    admin: AdminAccess,
    Path(parcel_id): Path<String>,
    request: Result<Json<AssignRiderRequest>, JsonRejection>,
) -> Result<Json<Parcel>, Error> {
    let Json(request) = request?;

    let (Some(rider_email), Some(rider_name)) = (request.rider_email, request.rider_name) else {
        return Err(Error::BadRequest("riderEmail and riderName are required"));
    };

    let parcel_id = ObjectId::from_str(&parcel_id).map_err(|_| Error::NoResource)?;

    let parcel = parcels
        .find_one_by_id(parcel_id)
        .await?
        .ok_or(Error::NoResource)
        .tap_err(|_| tracing::debug!("tried assigning non existing parcel"))?;

    if policy.is_strict() {
        if parcel.payment_status != PaymentStatus::Paid {
            return Err(Error::Conflict("parcel is not paid yet"));
        }
        if parcel.delivery_status != DeliveryStatus::Pending {
            return Err(Error::Conflict("parcel is already assigned"));
        }
    }

    parcels
        .update_one_by_id(
            parcel_id,
            bson::doc! {
                "$set": {
                    "assigned_rider_email": &rider_email,
                    "assigned_rider_name": &rider_name,
                    "delivery_status": DeliveryStatus::Assigned,
                }
            },
        )
        .await?;

    let parcel = ParcelModel {
        assigned_rider_email: Some(rider_email),
        assigned_rider_name: Some(rider_name),
        delivery_status: DeliveryStatus::Assigned,
        ..parcel
    };

    Ok(Json(parcel.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpdateStatusRequest {
    pub status: String,
}

#[tracing::instrument(
    skip_all,
    fields(
        id = %parcel_id,
        rider = %rider.email,
    )
)]
pub async fn update_status(
    State(parcels): State<ParcelCollection>,
    State(policy): State<TransitionPolicy>,
    rider: RiderAccess,
    Path(parcel_id): Path<String>,
    request: Result<Json<UpdateStatusRequest>, JsonRejection>,
) -> Result<Json<Parcel>, Error> {
    let Json(request) = request?;

    let next = match request.status.as_str() {
        "in_transit" => DeliveryStatus::InTransit,
        "delivered" => DeliveryStatus::Delivered,
        _ => return Err(Error::BadRequest("status must be in_transit or delivered")),
    };

    let parcel_id = ObjectId::from_str(&parcel_id).map_err(|_| Error::NoResource)?;

    let parcel = parcels
        .find_one_by_id(parcel_id)
        .await?
        .ok_or(Error::NoResource)?;

    if parcel.assigned_rider_email.as_deref() != Some(rider.email.as_str()) {
        return Err(Error::Forbidden)
            .tap_err(|_| tracing::debug!("rider is not assigned to this parcel"));
    }

    if policy.is_strict() && !parcel.delivery_status.may_advance_to(next) {
        return Err(Error::Conflict("invalid delivery status transition"));
    }

    parcels
        .update_one_by_id(parcel_id, bson::doc! { "$set": { "delivery_status": next } })
        .await?;

    let parcel = ParcelModel {
        delivery_status: next,
        ..parcel
    };

    Ok(Json(parcel.into()))
}

pub async fn rider_tasks(
    State(parcels): State<ParcelCollection>,
    rider: RiderAccess,
    Query(query): Query<EmailQuery>,
) -> Result<Json<ParcelListResponse>, Error> {
    if let Some(email) = &query.email {
        require_owned_email(&rider.email, email)?;
    }

    let filter = bson::doc! {
        "assigned_rider_email": &rider.email,
        "delivery_status": {
            "$in": [DeliveryStatus::Assigned, DeliveryStatus::InTransit],
        },
    };

    let parcels = collect_sorted(&parcels, filter, bson::doc! { "creation_date": -1 }).await?;

    Ok(Json(ParcelListResponse { parcels }))
}

pub async fn completed_parcels(
    State(parcels): State<ParcelCollection>,
    rider: RiderAccess,
    Query(query): Query<EmailQuery>,
) -> Result<Json<ParcelListResponse>, Error> {
    if let Some(email) = &query.email {
        require_owned_email(&rider.email, email)?;
    }

    let filter = bson::doc! {
        "assigned_rider_email": &rider.email,
        "delivery_status": {
            "$in": [DeliveryStatus::Delivered, DeliveryStatus::ServiceCenterDelivered],
        },
    };

    let parcels = collect_sorted(&parcels, filter, bson::doc! { "creation_date": -1 }).await?;

    Ok(Json(ParcelListResponse { parcels }))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::{extract::Path, Json};

    use crate::{api::v1::tests::bootstrap, app::TransitionPolicy, error::Error};

    use super::DeliveryStatus::*;

    #[test]
    fn test_forward_only_transitions() {
        assert!(Pending.may_advance_to(Assigned));
        assert!(Assigned.may_advance_to(InTransit));
        assert!(InTransit.may_advance_to(Delivered));
        assert!(InTransit.may_advance_to(ServiceCenterDelivered));

        assert!(!Pending.may_advance_to(InTransit));
        assert!(!Pending.may_advance_to(Delivered));
        assert!(!Assigned.may_advance_to(Delivered));
        assert!(!Delivered.may_advance_to(InTransit));
        assert!(!Delivered.may_advance_to(ServiceCenterDelivered));
        assert!(!ServiceCenterDelivered.may_advance_to(Delivered));
        assert!(!Assigned.may_advance_to(Pending));
    }

    #[test]
    fn test_completed_set() {
        assert!(Delivered.is_completed());
        assert!(ServiceCenterDelivered.is_completed());
        assert!(!Pending.is_completed());
        assert!(!Assigned.is_completed());
        assert!(!InTransit.is_completed());
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(
            serde_json::to_string(&ServiceCenterDelivered).unwrap(),
            "\"service_center_delivered\""
        );
        assert_eq!(
            serde_json::from_str::<super::DeliveryStatus>("\"in_transit\"").unwrap(),
            InTransit
        );
        assert_eq!(
            serde_json::to_string(&super::CashoutStatus::None).unwrap(),
            "\"none\""
        );
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_create_show_delete() {
        let bootstrap = bootstrap().await;

        let parcel = bootstrap.create_parcel("sender@test.com").await;

        let Json(found) = super::show(bootstrap.parcels(), Path(parcel.id.to_string()))
            .await
            .unwrap();
        assert_eq!(found.sender_email, "sender@test.com");
        assert_eq!(found.payment_status, super::PaymentStatus::Unpaid);
        assert_eq!(found.delivery_status, Pending);

        let error = super::show(
            bootstrap.parcels(),
            Path(bson::oid::ObjectId::new().to_string()),
        )
        .await
        .unwrap_err();
        assert_matches!(error, Error::NoResource);

        let Json(deleted) = super::delete(bootstrap.parcels(), Path(parcel.id.to_string()))
            .await
            .unwrap();
        assert_eq!(deleted.deleted_count, 1);
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_index_ownership() {
        let bootstrap = bootstrap().await;

        let _ = bootstrap.create_parcel("alice@x.com").await;

        let error = super::index(
            bootstrap.parcels(),
            bootstrap.session_for("alice@x.com"),
            axum::extract::Query(super::EmailQuery {
                email: Some("bob@x.com".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(error, Error::Forbidden);

        let Json(list) = super::index(
            bootstrap.parcels(),
            bootstrap.session_for("alice@x.com"),
            axum::extract::Query(super::EmailQuery {
                email: Some("alice@x.com".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(list.parcels.len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_assign_requires_rider_fields() {
        let bootstrap = bootstrap().await;

        let parcel = bootstrap.paid_parcel("sender@test.com").await;

        let error = super::assign(
            bootstrap.parcels(),
            bootstrap.policy(),
            bootstrap.admin_access(),
            Path(parcel.id.to_string()),
            Ok(Json(super::AssignRiderRequest {
                rider_email: Some("rider@test.com".to_string()),
                rider_name: None,
            })),
        )
        .await
        .unwrap_err();
        assert_matches!(error, Error::BadRequest(_));
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_assign_strict_rejects_reassignment() {
        let bootstrap = bootstrap().await;

        let parcel = bootstrap.paid_parcel("sender@test.com").await;

        let _ = bootstrap.assign(&parcel, "rider@test.com").await.unwrap();

        let error = bootstrap.assign(&parcel, "other@test.com").await.unwrap_err();
        assert_matches!(error, Error::Conflict(_));
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_assign_strict_rejects_unpaid() {
        let bootstrap = bootstrap().await;

        let parcel = bootstrap.create_parcel("sender@test.com").await;

        let error = bootstrap.assign(&parcel, "rider@test.com").await.unwrap_err();
        assert_matches!(error, Error::Conflict(_));
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_assign_lenient_allows_reassignment() {
        let bootstrap = bootstrap().await;

        let parcel = bootstrap.create_parcel("sender@test.com").await;

        let Json(parcel) = super::assign(
            bootstrap.parcels(),
            axum::extract::State(TransitionPolicy::Lenient),
            bootstrap.admin_access(),
            Path(parcel.id.to_string()),
            Ok(Json(super::AssignRiderRequest {
                rider_email: Some("rider@test.com".to_string()),
                rider_name: Some("Rider".to_string()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(parcel.delivery_status, Assigned);

        let Json(parcel) = super::assign(
            bootstrap.parcels(),
            axum::extract::State(TransitionPolicy::Lenient),
            bootstrap.admin_access(),
            Path(parcel.id.to_string()),
            Ok(Json(super::AssignRiderRequest {
                rider_email: Some("other@test.com".to_string()),
                rider_name: Some("Other".to_string()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(parcel.assigned_rider_email.as_deref(), Some("other@test.com"));
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_update_status_rejects_unknown_value() {
        let bootstrap = bootstrap().await;

        let parcel = bootstrap.paid_parcel("sender@test.com").await;
        let _ = bootstrap.assign(&parcel, "rider@test.com").await.unwrap();
        let rider = bootstrap.rider_access("rider@test.com").await;

        let error = super::update_status(
            bootstrap.parcels(),
            bootstrap.policy(),
            rider,
            Path(parcel.id.to_string()),
            Ok(Json(super::UpdateStatusRequest {
                status: "pending".to_string(),
            })),
        )
        .await
        .unwrap_err();
        assert_matches!(error, Error::BadRequest(_));
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_update_status_requires_assigned_rider() {
        let bootstrap = bootstrap().await;

        let parcel = bootstrap.paid_parcel("sender@test.com").await;
        let _ = bootstrap.assign(&parcel, "rider@test.com").await.unwrap();
        let intruder = bootstrap.rider_access("intruder@test.com").await;

        let error = super::update_status(
            bootstrap.parcels(),
            bootstrap.policy(),
            intruder,
            Path(parcel.id.to_string()),
            Ok(Json(super::UpdateStatusRequest {
                status: "in_transit".to_string(),
            })),
        )
        .await
        .unwrap_err();
        assert_matches!(error, Error::Forbidden);
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_update_status_strict_forward_only() {
        let bootstrap = bootstrap().await;

        let parcel = bootstrap.paid_parcel("sender@test.com").await;
        let _ = bootstrap.assign(&parcel, "rider@test.com").await.unwrap();
        let rider = bootstrap.rider_access("rider@test.com").await;

        // assigned -> delivered skips in_transit
        let error = super::update_status(
            bootstrap.parcels(),
            bootstrap.policy(),
            rider.clone(),
            Path(parcel.id.to_string()),
            Ok(Json(super::UpdateStatusRequest {
                status: "delivered".to_string(),
            })),
        )
        .await
        .unwrap_err();
        assert_matches!(error, Error::Conflict(_));

        let Json(parcel) = super::update_status(
            bootstrap.parcels(),
            bootstrap.policy(),
            rider.clone(),
            Path(parcel.id.to_string()),
            Ok(Json(super::UpdateStatusRequest {
                status: "in_transit".to_string(),
            })),
        )
        .await
        .unwrap();
        assert_eq!(parcel.delivery_status, InTransit);

        let Json(parcel) = super::update_status(
            bootstrap.parcels(),
            bootstrap.policy(),
            rider,
            Path(parcel.id.to_string()),
            Ok(Json(super::UpdateStatusRequest {
                status: "delivered".to_string(),
            })),
        )
        .await
        .unwrap();
        assert_eq!(parcel.delivery_status, Delivered);
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_assignable_lists_paid_pending_only() {
        let bootstrap = bootstrap().await;

        let _unpaid = bootstrap.create_parcel("sender@test.com").await;
        let paid = bootstrap.paid_parcel("sender2@test.com").await;
        let assigned = bootstrap.paid_parcel("sender3@test.com").await;
        let _ = bootstrap.assign(&assigned, "rider@test.com").await.unwrap();

        let Json(list) = super::assignable(bootstrap.parcels(), bootstrap.admin_access())
            .await
            .unwrap();

        assert_eq!(list.parcels.len(), 1);
        assert_eq!(list.parcels[0].id, paid.id);
    }
}
