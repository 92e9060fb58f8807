use axum::{
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use mongodb::options::FindOptions;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::OffsetDateTime;

use crate::{app::TransitionPolicy, error::Error, util::DecimalString, util::PathObjectId};

use super::{
    auth::{AdminAccess, RiderAccess},
    parcel::{CashoutStatus, DeliveryStatus, Parcel, ParcelCollection},
};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestCashoutRequest {
    #[serde(default, alias = "riderEarned")]
    pub rider_earned: Option<DecimalString>,
}

/// First step of the cashout state machine: none -> requested. Only the
/// assigned rider of a delivered parcel may request, and only once.
#[tracing::instrument(
    skip_all,
    fields(
        id = %parcel_id.0,
        rider = %rider.email,
    )
)]
pub async fn request_cashout(
    State(parcels): State<ParcelCollection>,
    rider: RiderAccess,
    parcel_id: PathObjectId,
    request: Result<Json<RequestCashoutRequest>, JsonRejection>,
) -> Result<Json<Parcel>, Error> {
    let Json(request) = request.map_err(|_| Error::BadRequest("riderEarned must be a number"))?;

    let rider_earned: Decimal = request
        .rider_earned
        .ok_or(Error::BadRequest("riderEarned must be a number"))?
        .into();

    let PathObjectId(parcel_id) = parcel_id;

    let parcel = parcels
        .find_one_by_id(parcel_id)
        .await?
        .ok_or(Error::NoResource)
        .tap_err(|_| tracing::debug!("tried cashing out non existing parcel"))?;

    if parcel.assigned_rider_email.as_deref() != Some(rider.email.as_str()) {
        return Err(Error::Forbidden)
            .tap_err(|_| tracing::debug!("rider is not assigned to this parcel"));
    }

    if !parcel.delivery_status.is_completed() {
        return Err(Error::BadRequest("parcel is not eligible for cashout"));
    }

    match parcel.cashout_status {
        CashoutStatus::Requested | CashoutStatus::Paid => {
            return Err(Error::Conflict("cashout already requested"))
        }
        CashoutStatus::None => {}
    }

    let now = OffsetDateTime::now_utc();

    // guarded update: the first request wins, a concurrent duplicate
    // matches nothing
    let result = parcels
        .update_one(
            bson::doc! {
                "_id": parcel_id,
                "cashout_status": { "$nin": [CashoutStatus::Requested, CashoutStatus::Paid] },
            },
            bson::doc! {
                "$set": {
                    "rider_earned": bson::to_bson(&rider_earned)?,
                    "cashout_status": CashoutStatus::Requested,
                    "cashout_requested_at": bson::DateTime::from(now),
                }
            },
            None,
        )
        .await?;

    if result.matched_count == 0 {
        return Err(Error::Conflict("cashout already requested"));
    }

    let parcel = Parcel::from(parcel);
    Ok(Json(Parcel {
        rider_earned: Some(rider_earned),
        cashout_status: CashoutStatus::Requested,
        cashout_requested_at: Some(now.into()),
        ..parcel
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CashoutListQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CashoutListResponse {
    pub parcels: Vec<Parcel>,
}

pub async fn list_cashouts(
    State(parcels): State<ParcelCollection>,
    _admin: AdminAccess,
    Query(query): Query<CashoutListQuery>,
) -> Result<Json<CashoutListResponse>, Error> {
    let status = match query.status.as_deref() {
        None | Some("requested") => CashoutStatus::Requested,
        Some("paid") => CashoutStatus::Paid,
        Some("none") => CashoutStatus::None,
        Some(_) => return Err(Error::BadRequest("invalid cashout status")),
    };

    let filter = bson::doc! {
        "cashout_status": status,
        "delivery_status": {
            "$in": [DeliveryStatus::Delivered, DeliveryStatus::ServiceCenterDelivered],
        },
    };
    let options = FindOptions::builder()
        .sort(bson::doc! { "cashout_requested_at": -1 })
        .build();

    let mut cursor = parcels.find(filter, options).await?;

    let mut result = vec![];

    while cursor.advance().await? {
        let parcel = cursor.deserialize_current()?;

        result.push(parcel.into());
    }

    Ok(Json(CashoutListResponse { parcels: result }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConfirmCashoutRequest {
    #[serde(default, alias = "confirmedBy")]
    pub confirmed_by: Option<String>,
}

/// Second step: requested -> paid. Under the strict policy a confirmation
/// without a prior request is rejected; lenient keeps the legacy jump.
#[tracing::instrument(
    skip_all,
    fields(
        id = %parcel_id.0,
        admin = %admin.email,
    )
)]
pub async fn confirm_cashout(
    State(parcels): State<ParcelCollection>,
    State(policy): State<TransitionPolicy>,
    admin: AdminAccess,
    parcel_id: PathObjectId,
    request: Result<Json<ConfirmCashoutRequest>, JsonRejection>,
) -> Result<Json<Parcel>, Error> {
    let Json(request) = request?;

    let confirmed_by = request
        .confirmed_by
        .ok_or(Error::BadRequest("confirmedBy is required"))?;

    let PathObjectId(parcel_id) = parcel_id;

    let parcel = parcels
        .find_one_by_id(parcel_id)
        .await?
        .ok_or(Error::NoResource)?;

    match parcel.cashout_status {
        CashoutStatus::Paid => return Err(Error::Conflict("cashout already paid")),
        CashoutStatus::None if policy.is_strict() => {
            return Err(Error::Conflict("no cashout requested"))
        }
        CashoutStatus::None | CashoutStatus::Requested => {}
    }

    let guard = if policy.is_strict() {
        bson::doc! { "cashout_status": CashoutStatus::Requested }
    } else {
        bson::doc! { "cashout_status": { "$ne": CashoutStatus::Paid } }
    };

    let mut filter = bson::doc! { "_id": parcel_id };
    filter.extend(guard);

    let now = OffsetDateTime::now_utc();

    let result = parcels
        .update_one(
            filter,
            bson::doc! {
                "$set": {
                    "cashout_status": CashoutStatus::Paid,
                    "cashout_paid_at": bson::DateTime::from(now),
                    "cashout_confirmed_by": &confirmed_by,
                }
            },
            None,
        )
        .await?;

    if result.matched_count == 0 {
        return Err(Error::Conflict("cashout already paid"));
    }

    let parcel = Parcel::from(parcel);
    Ok(Json(Parcel {
        cashout_status: CashoutStatus::Paid,
        cashout_paid_at: Some(now.into()),
        cashout_confirmed_by: Some(confirmed_by),
        ..parcel
    }))
}
