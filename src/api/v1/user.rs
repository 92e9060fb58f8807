use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    Json,
};
use bson::oid::ObjectId;
use mongodb::options::FindOptions;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use validator::Validate;

use crate::{
    error::Error,
    mongo_ext::Collection,
    util::{FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::auth::AdminAccess;

#[derive(Clone)]
pub struct UserCollection(pub Collection<UserModel>);

impl std::ops::Deref for UserCollection {
    type Target = Collection<UserModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: UserRole,

    pub created_at: bson::DateTime,
    pub last_log_in: bson::DateTime,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    User,
    Rider,
    Admin,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Rider => "rider",
            Self::Admin => "admin",
        }
    }
}

impl From<UserRole> for bson::Bson {
    fn from(value: UserRole) -> Self {
        bson::Bson::String(value.as_str().to_string())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct User {
    pub id: ObjectIdString,
    pub email: String,
    pub name: Option<String>,
    pub role: UserRole,

    pub created_at: FormattedDateTime,
    pub last_log_in: FormattedDateTime,
}

impl From<UserModel> for User {
    fn from(value: UserModel) -> Self {
        Self {
            id: value.id.into(),
            email: value.email,
            name: value.name,
            role: value.role,

            created_at: value.created_at.into(),
            last_log_in: value.last_log_in.into(),
        }
    }
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct UpsertUserRequest {
    #[validate(email)]
    pub email: String,

    #[validate(length(min = 1, max = 124))]
    pub name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpsertUserResponse {
    pub inserted: bool,
    pub user: User,
}

/// Login upsert: first sight of an email inserts a user with the default
/// role, every later call only refreshes the last-login timestamp.
pub async fn upsert(
    State(users): State<UserCollection>,
    request: Result<Json<UpsertUserRequest>, JsonRejection>,
) -> Result<Json<UpsertUserResponse>, Error> {
    let Json(request) = request?;
    request.validate()?;

    let now = OffsetDateTime::now_utc();

    if let Some(existing) = users
        .find_one(bson::doc! { "email": &request.email }, None)
        .await?
    {
        users
            .update_one_by_id(
                existing.id,
                bson::doc! { "$set": { "last_log_in": bson::DateTime::from(now) } },
            )
            .await?;

        let user = UserModel {
            last_log_in: now.into(),
            ..existing
        };

        return Ok(Json(UpsertUserResponse {
            inserted: false,
            user: user.into(),
        }));
    }

    let model = UserModel {
        id: ObjectId::new(),
        email: request.email,
        name: request.name,
        role: UserRole::default(),
        created_at: now.into(),
        last_log_in: now.into(),
    };
    users.insert_one(&model, None).await?;

    Ok(Json(UpsertUserResponse {
        inserted: true,
        user: model.into(),
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RoleResponse {
    pub role: UserRole,
}

pub async fn role(
    State(users): State<UserCollection>,
    Path(email): Path<String>,
) -> Result<Json<RoleResponse>, Error> {
    let user = users
        .find_one(bson::doc! { "email": &email }, None)
        .await?
        .ok_or(Error::NoResource)?;

    Ok(Json(RoleResponse { role: user.role }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SearchQuery {
    #[serde(default)]
    pub query: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SearchResponse {
    pub users: Vec<User>,
}

const SEARCH_LIMIT: i64 = 10;

pub async fn search(
    State(users): State<UserCollection>,
    _admin: AdminAccess,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, Error> {
    let filter = bson::doc! {
        "$or": [
            { "email": { "$regex": &query.query, "$options": "i" } },
            { "name": { "$regex": &query.query, "$options": "i" } },
        ]
    };
    let options = FindOptions::builder().limit(SEARCH_LIMIT).build();

    let mut cursor = users.find(filter, options).await?;

    let mut result = vec![];

    while cursor.advance().await? {
        let user = cursor.deserialize_current()?;

        result.push(user.into());
    }

    Ok(Json(SearchResponse { users: result }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetRoleRequest {
    pub role: UserRole,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetRoleResponse {
    pub matched_count: u64,
    pub modified_count: u64,
}

pub async fn set_role(
    State(users): State<UserCollection>,
    _admin: AdminAccess,
    PathObjectId(user_id): PathObjectId,
    request: Result<Json<SetRoleRequest>, JsonRejection>,
) -> Result<Json<SetRoleResponse>, Error> {
    let Json(request) = request?;

    let result = users
        .update_one_by_id(user_id, bson::doc! { "$set": { "role": request.role } })
        .await?;

    if result.matched_count == 0 {
        return Err(Error::NoResource);
    }

    Ok(Json(SetRoleResponse {
        matched_count: result.matched_count,
        modified_count: result.modified_count,
    }))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::{extract::Path, Json};

    use crate::{api::v1::tests::bootstrap, error::Error};

    use super::UserRole;

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&UserRole::Rider).unwrap(), "\"rider\"");
        assert_eq!(
            serde_json::from_str::<UserRole>("\"admin\"").unwrap(),
            UserRole::Admin
        );
        serde_json::from_str::<UserRole>("\"superadmin\"").unwrap_err();
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_upsert_then_refresh() {
        let bootstrap = bootstrap().await;

        let Json(first) = super::upsert(
            bootstrap.users(),
            Ok(Json(super::UpsertUserRequest {
                email: "sender@test.com".to_string(),
                name: Some("Sender".to_string()),
            })),
        )
        .await
        .unwrap();

        assert!(first.inserted);
        assert_eq!(first.user.role, UserRole::User);

        let Json(second) = super::upsert(
            bootstrap.users(),
            Ok(Json(super::UpsertUserRequest {
                email: "sender@test.com".to_string(),
                name: None,
            })),
        )
        .await
        .unwrap();

        assert!(!second.inserted);
        assert_eq!(second.user.id, first.user.id);
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_role_of_unknown_email() {
        let bootstrap = bootstrap().await;

        let error = super::role(bootstrap.users(), Path("ghost@test.com".to_string()))
            .await
            .unwrap_err();
        assert_matches!(error, Error::NoResource);
    }

    #[tokio::test]
    #[ignore = "requires a running MongoDB"]
    async fn test_set_role_then_fetch() {
        let bootstrap = bootstrap().await;

        let user = bootstrap.create_user("promotee@test.com", UserRole::User).await;

        let _ = super::set_role(
            bootstrap.users(),
            bootstrap.admin_access(),
            crate::util::PathObjectId(user.id),
            Ok(Json(super::SetRoleRequest {
                role: UserRole::Rider,
            })),
        )
        .await
        .unwrap();

        let Json(role) = super::role(bootstrap.users(), Path("promotee@test.com".to_string()))
            .await
            .unwrap();
        assert_eq!(role.role, UserRole::Rider);
    }
}
