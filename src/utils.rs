use actix_web::{HttpRequest, http::header};
use jsonwebtoken::{Algorithm, DecodingKey, TokenData, Validation, decode};
use serde::{Deserialize, Serialize};

/// Verified identity of the caller, issued by the auth collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub bg_color: String,
}

pub fn get_user_details(
    token: &str,
    verifying_key: &DecodingKey,
) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data: TokenData<Claims> =
        decode(token, verifying_key, &Validation::new(Algorithm::HS256))?;

    Ok(token_data.claims)
}

pub fn get_access_token_from_auth_header(req: HttpRequest) -> Option<String> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header_value| header_value.to_str().ok())
        .and_then(|header| {
            if header.starts_with("Bearer ") {
                header.split_whitespace().nth(1)
            } else {
                None
            }
        })
        .map(|header| header.to_string());

    token
}
