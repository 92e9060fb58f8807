use axum::{
    extract::{rejection::JsonRejection, FromRef, FromRequestParts, State},
    headers::{Cookie, Header, SetCookie},
    http::{request::Parts, HeaderValue},
    Json, RequestPartsExt, TypedHeader,
};
use jsonwebtoken::TokenData;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::{Duration, OffsetDateTime};
use validator::Validate;

use crate::error::{Error, UnauthorizedType};

use super::user::{UserCollection, UserRole};

pub const SESSION_COOKIE: &str = "session_token";

const SESSION_TTL: Duration = Duration::days(1);

#[derive(Clone)]
pub struct JwtState {
    validation: jsonwebtoken::Validation,
    header: jsonwebtoken::Header,

    encoding_key: jsonwebtoken::EncodingKey,
    decoding_key: jsonwebtoken::DecodingKey,
}

impl JwtState {
    pub fn new(secret: &str) -> Self {
        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        // expiry is checked against the claims so expired tokens still decode
        validation.validate_exp = false;

        Self {
            header,
            validation,

            encoding_key: jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn new_from_env() -> Self {
        let secret = std::env::var("SESSION_SECRET_KEY")
            .expect("Missing required environment variable: SESSION_SECRET_KEY");

        Self::new(&secret)
    }
}

pub fn current_timestamp() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// The session credential only proves an email. The caller's role is looked
/// up fresh on every request, never read from the token.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionClaims {
    pub sub: String,
    pub exp: i64,
}

impl SessionClaims {
    pub fn is_expired(&self) -> bool {
        self.exp < current_timestamp().unix_timestamp()
    }
}

pub fn generate_session_token(jwt_state: &JwtState, email: &str) -> Result<String, Error> {
    let expired_at = current_timestamp() + SESSION_TTL;

    generate_session_token_with_exp(jwt_state, email, expired_at.unix_timestamp())
}

pub fn generate_session_token_with_exp(
    jwt_state: &JwtState,
    email: &str,
    exp: i64,
) -> Result<String, Error> {
    let claims = SessionClaims {
        sub: email.to_string(),
        exp,
    };

    jsonwebtoken::encode(&jwt_state.header, &claims, &jwt_state.encoding_key).map_err(Into::into)
}

pub fn decode_session_token(
    jwt_state: &JwtState,
    token: &str,
) -> Result<TokenData<SessionClaims>, Error> {
    jsonwebtoken::decode(token, &jwt_state.decoding_key, &jwt_state.validation).map_err(Into::into)
}

/// Verified identity extracted from the session cookie.
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub email: String,
}

impl SessionUser {
    pub fn from_token(jwt_state: &JwtState, token: &str) -> Result<Self, Error> {
        let token = decode_session_token(jwt_state, token)
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidSessionToken))?;

        if token.claims.is_expired() {
            return Err(Error::Unauthorized(UnauthorizedType::InvalidSessionToken));
        }

        Ok(Self {
            email: token.claims.sub,
        })
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for SessionUser
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let cookie = parts
            .extract::<TypedHeader<Cookie>>()
            .await
            .map_err(|_| Error::Unauthorized(UnauthorizedType::MissingSessionToken))
            .tap_err(|_| tracing::debug!("cookie not found"))?;

        let token = cookie
            .get(SESSION_COOKIE)
            .ok_or(Error::Unauthorized(UnauthorizedType::MissingSessionToken))
            .tap_err(|_| tracing::debug!("session token not found"))?;

        let jwt = JwtState::from_ref(state);

        Self::from_token(&jwt, token)
    }
}

/// Verified identity whose user record currently has the admin role.
#[derive(Debug, Clone)]
pub struct AdminAccess {
    pub email: String,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AdminAccess
where
    JwtState: FromRef<S>,
    UserCollection: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = parts.extract_with_state::<SessionUser, _>(state).await?;

        let users = UserCollection::from_ref(state);
        match lookup_role(&users, &session.email).await? {
            UserRole::Admin => Ok(Self {
                email: session.email,
            }),
            _ => Err(Error::Forbidden)
                .tap_err(|_| tracing::debug!("admin route accessed without admin role")),
        }
    }
}

/// Verified identity whose user record currently has the rider role.
#[derive(Debug, Clone)]
pub struct RiderAccess {
    pub email: String,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RiderAccess
where
    JwtState: FromRef<S>,
    UserCollection: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = parts.extract_with_state::<SessionUser, _>(state).await?;

        let users = UserCollection::from_ref(state);
        match lookup_role(&users, &session.email).await? {
            UserRole::Rider => Ok(Self {
                email: session.email,
            }),
            _ => Err(Error::Forbidden)
                .tap_err(|_| tracing::debug!("rider route accessed without rider role")),
        }
    }
}

async fn lookup_role(users: &UserCollection, email: &str) -> Result<UserRole, Error> {
    let user = users
        .find_one(bson::doc! { "email": email }, None)
        .await?
        .ok_or(Error::Forbidden)
        .tap_err(|_| tracing::debug!("no user record for verified email"))?;

    Ok(user.role)
}

/// Resource-ownership check: a caller-supplied email parameter must match
/// the verified session email.
pub fn require_owned_email(caller_email: &str, requested_email: &str) -> Result<(), Error> {
    if caller_email != requested_email {
        return Err(Error::Forbidden)
            .tap_err(|_| tracing::debug!("email parameter does not match session email"));
    }

    Ok(())
}

fn set_cookie(value: String) -> TypedHeader<SetCookie> {
    TypedHeader(
        SetCookie::decode(
            &mut [HeaderValue::from_str(&value).unwrap()].as_slice().iter(),
        )
        .unwrap(),
    )
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct ValidationRequest {
    #[validate(email)]
    pub email: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ValidationResponse {
    pub token: String,
}

pub async fn validation(
    State(jwt_state): State<JwtState>,
    request: Result<Json<ValidationRequest>, JsonRejection>,
) -> Result<(TypedHeader<SetCookie>, Json<ValidationResponse>), Error> {
    let Json(request) = request?;
    request.validate()?;

    let token = generate_session_token(&jwt_state, &request.email)?;

    let header = set_cookie(format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
        SESSION_COOKIE,
        token,
        SESSION_TTL.whole_seconds(),
    ));

    Ok((header, Json(ValidationResponse { token })))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogoutResponse {
    pub success: bool,
}

pub async fn logout() -> (TypedHeader<SetCookie>, Json<LogoutResponse>) {
    let header = set_cookie(format!(
        "{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0",
        SESSION_COOKIE,
    ));

    (header, Json(LogoutResponse { success: true }))
}
