use crate::shared::error::ServiceError;
use actix_web::http::header::AUTHORIZATION;
use actix_web::HttpRequest;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Accounts live with the external auth collaborator; we only decode the
// actor identity out of the bearer token it issued.

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

pub fn current_user_id(req: &HttpRequest, secret: &str) -> Result<Uuid, ServiceError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::NotAuthorized("missing bearer token".to_string()))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ServiceError::NotAuthorized("malformed authorization header".to_string()))?;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| ServiceError::NotAuthorized(format!("invalid token: {}", e)))?;
    Ok(data.claims.sub)
}

pub fn issue_token(user_id: Uuid, secret: &str, ttl_secs: i64) -> Result<String, ServiceError> {
    let claims = Claims {
        sub: user_id,
        exp: (chrono::Utc::now().timestamp() + ttl_secs) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ServiceError::NotAuthorized(format!("failed to sign token: {}", e)))
}
