use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use tracing::debug;

use crate::errors::AppError;
use crate::models::user::Claims;
use crate::state::AppState;

pub fn decode_claims(token: &str, secret: &str) -> Result<Claims, AppError> {
    let decoding_key = DecodingKey::from_secret(secret.as_ref());
    decode::<Claims>(token, &decoding_key, &Validation::new(Algorithm::HS256))
        .map(|data| data.claims)
        .map_err(|e| {
            debug!("Rejected bearer token: {}", e);
            AppError::AuthError
        })
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = headers
        .get("authorization")
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .ok_or(AppError::AuthError)?;

    let claims = decode_claims(token, &state.jwt_secret)?;

    // Handlers pick these up with Extension<Claims>
    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}

pub fn require_admin(claims: &Claims) -> Result<(), AppError> {
    if claims.role.is_admin() {
        Ok(())
    } else {
        Err(AppError::Unauthorized)
    }
}
