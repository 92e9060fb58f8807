use std::str::FromStr;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    Json,
};
use bson::oid::ObjectId;
use mongodb::options::FindOptions;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::OffsetDateTime;
use validator::Validate;

use crate::{
    app::start_transaction,
    error::Error,
    mongo_ext::Collection,
    util::{FormattedDateTime, ObjectIdString},
};

use super::{
    auth::{AdminAccess, SessionUser},
    user::{UserCollection, UserRole},
};

#[derive(Clone)]
pub struct RiderCollection(pub Collection<RiderModel>);

impl std::ops::Deref for RiderCollection {
    type Target = Collection<RiderModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiderStatus {
    Pending,
    Active,
    Rejected,
    Deactivated,
}

impl RiderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Rejected => "rejected",
            Self::Deactivated => "deactivated",
        }
    }
}

impl From<RiderStatus> for bson::Bson {
    fn from(value: RiderStatus) -> Self {
        bson::Bson::String(value.as_str().to_string())
    }
}

/// One application per email; profile fields (phone, region, district,
/// vehicle...) are stored as submitted.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RiderModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub name: String,
    pub email: String,
    pub status: RiderStatus,

    pub applied_at: bson::DateTime,

    #[serde(flatten)]
    pub profile: bson::Document,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Rider {
    pub id: ObjectIdString,

    pub name: String,
    pub email: String,
    pub status: RiderStatus,

    pub applied_at: FormattedDateTime,

    #[serde(flatten)]
    pub profile: bson::Document,
}

impl From<RiderModel> for Rider {
    fn from(value: RiderModel) -> Self {
        Self {
            id: value.id.into(),

            name: value.name,
            email: value.email,
            status: value.status,

            applied_at: value.applied_at.into(),

            profile: value.profile,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RiderListResponse {
    pub riders: Vec<Rider>,
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct ApplyRequest {
    #[validate(length(min = 1, max = 124))]
    pub name: String,

    #[validate(email)]
    pub email: String,

    #[serde(flatten)]
    pub profile: bson::Document,
}

pub async fn apply(
    State(riders): State<RiderCollection>,
    _session: SessionUser,
    request: Result<Json<ApplyRequest>, JsonRejection>,
) -> Result<Json<Rider>, Error> {
    let Json(request) = request?;
    request.validate()?;

    let count = riders
        .count_documents(bson::doc! { "email": &request.email }, None)
        .await?;

    if count > 0 {
        return Err(Error::AlreadyApplied)
            .tap_err(|_| tracing::debug!("duplicate rider application"));
    }

    let model = RiderModel {
        id: ObjectId::new(),

        name: request.name,
        email: request.email,
        status: RiderStatus::Pending,

        applied_at: OffsetDateTime::now_utc().into(),

        profile: request.profile,
    };

    riders.insert_one(&model, None).await?;

    Ok(Json(model.into()))
}

pub async fn pending(
    State(riders): State<RiderCollection>,
    _admin: AdminAccess,
) -> Result<Json<RiderListResponse>, Error> {
    let options = FindOptions::builder()
        .sort(bson::doc! { "applied_at": -1 })
        .build();

    let mut cursor = riders
        .find(bson::doc! { "status": RiderStatus::Pending }, options)
        .await?;

    let mut result = vec![];

    while cursor.advance().await? {
        let rider = cursor.deserialize_current()?;

        result.push(rider.into());
    }

    Ok(Json(RiderListResponse { riders: result }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetStatusRequest {
    pub status: RiderStatus,

    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetStatusResponse {
    pub matched_count: u64,
    pub modified_count: u64,
}

/// Approving an application and promoting the applicant's user role are one
/// unit: both writes go through the same session transaction.
#[tracing::instrument(
    skip_all,
    fields(
        id = %rider_id,
        admin = %admin.email,
    )
)]
pub async fn set_status(
    State(riders): State<RiderCollection>,
    State(users): State<UserCollection>,
    State(mongo): State<mongodb::Client>,
    admin: AdminAccess,
    Path(rider_id): Path<String>,
    request: Result<Json<SetStatusRequest>, JsonRejection>,
) -> Result<Json<SetStatusResponse>, Error> {
    let Json(request) = request?;

    let rider_id = ObjectId::from_str(&rider_id).map_err(|_| Error::NoResource)?;

    let mut session = start_transaction(&mongo).await?;

    let result = riders
        .update_one_by_id_with_session(
            rider_id,
            bson::doc! { "$set": { "status": request.status } },
            &mut session,
        )
        .await?;

    if result.matched_count == 0 {
        session.abort_transaction().await?;
        return Err(Error::NoResource)
            .tap_err(|_| tracing::debug!("tried updating non existing rider application"));
    }

    if matches!(request.status, RiderStatus::Active) {
        if let Some(email) = &request.email {
            users
                .update_one_with_session(
                    bson::doc! { "email": email },
                    bson::doc! { "$set": { "role": UserRole::Rider } },
                    None,
                    &mut session,
                )
                .await?;
        }
    }

    session.commit_transaction().await?;

    Ok(Json(SetStatusResponse {
        matched_count: result.matched_count,
        modified_count: result.modified_count,
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActiveQuery {
    #[serde(default)]
    pub search: Option<String>,
}

pub async fn active(
    State(riders): State<RiderCollection>,
    _admin: AdminAccess,
    Query(query): Query<ActiveQuery>,
) -> Result<Json<RiderListResponse>, Error> {
    let mut filter = bson::doc! { "status": RiderStatus::Active };

    if let Some(search) = query.search.filter(|it| !it.is_empty()) {
        filter.insert(
            "$or",
            vec![
                bson::doc! { "name": { "$regex": &search, "$options": "i" } },
                bson::doc! { "email": { "$regex": &search, "$options": "i" } },
                bson::doc! { "district": { "$regex": &search, "$options": "i" } },
            ],
        );
    }

    let options = FindOptions::builder()
        .sort(bson::doc! { "applied_at": -1 })
        .build();

    let mut cursor = riders.find(filter, options).await?;

    let mut result = vec![];

    while cursor.advance().await? {
        let rider = cursor.deserialize_current()?;

        result.push(rider.into());
    }

    Ok(Json(RiderListResponse { riders: result }))
}
