use std::sync::OnceLock;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::errors::{AppError, ErrorCode};
use crate::types::auth::{AuthUser, Claims};

static JWT_SECRET: OnceLock<String> = OnceLock::new();

/// Installs the secret used to verify access tokens. First call wins.
pub fn set_jwt_secret(secret: impl Into<String>) {
    let _ = JWT_SECRET.set(secret.into());
}

fn jwt_secret() -> &'static str {
    JWT_SECRET.get_or_init(|| {
        std::env::var("JWT_SECRET").unwrap_or_else(|_| "development-secret-change-in-production".to_string())
    })
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers)?;
        let claims = validate_jwt(&token)?;

        if claims.is_expired() {
            return Err(AppError::new(ErrorCode::TokenExpired, "token has expired"));
        }

        Ok(AuthUser::from(claims))
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    let auth_header = headers
        .get("Authorization")
        .ok_or_else(|| AppError::unauthorized("missing authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("invalid authorization header"))?;

    auth_header
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or_else(|| AppError::unauthorized("authorization header must use Bearer scheme"))
}

fn validate_jwt(token: &str) -> Result<Claims, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    // Platform tokens carry `aud = authenticated`; the audience is not part of our trust decision.
    validation.validate_aud = false;

    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(jwt_secret().as_bytes()), &validation)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                AppError::new(ErrorCode::TokenExpired, "token has expired")
            }
            _ => AppError::new(ErrorCode::TokenInvalid, format!("invalid token: {e}")),
        })?;

    Ok(token_data.claims)
}

/// Signs claims with the installed secret. Used by local tooling and tests.
pub fn issue_token(claims: &Claims) -> Result<String, AppError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(jwt_secret().as_bytes()),
    )
    .map_err(|e| AppError::internal(format!("failed to sign token: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use uuid::Uuid;

    async fn extract(header: Option<String>) -> Result<AuthUser, AppError> {
        let mut builder = Request::builder().uri("/matches");
        if let Some(value) = header {
            builder = builder.header("Authorization", value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        AuthUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn valid_token_yields_subject() {
        let user_id = Uuid::new_v4();
        let token = issue_token(&Claims::new(user_id, 3600)).unwrap();

        let user = extract(Some(format!("Bearer {token}"))).await.unwrap();
        assert_eq!(user.id, user_id);
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let err = extract(None).await.unwrap_err();
        assert!(err.is(ErrorCode::Unauthorized));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let mut claims = Claims::new(Uuid::new_v4(), 0);
        claims.exp -= 3600;
        let token = issue_token(&claims).unwrap();

        let err = extract(Some(format!("Bearer {token}"))).await.unwrap_err();
        assert!(err.is(ErrorCode::TokenExpired));
    }

    #[tokio::test]
    async fn garbage_token_is_invalid() {
        let err = extract(Some("Bearer not-a-jwt".into())).await.unwrap_err();
        assert!(err.is(ErrorCode::TokenInvalid));
    }
}
