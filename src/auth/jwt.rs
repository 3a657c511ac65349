use std::str::FromStr;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::config::JwtConfig;
use crate::error::AppError;

use super::Claims;

/// Verifies the bearer tokens handed to the WebSocket endpoint.
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(config: &JwtConfig) -> Result<Self, AppError> {
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let algorithm = Algorithm::from_str(&config.algorithm).map_err(|_| {
            AppError::Validation(format!("Unsupported JWT algorithm: {}", config.algorithm))
        })?;
        let mut validation = Validation::new(algorithm);

        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }

        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        }

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AppError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

        if token_data.claims.sub.is_empty() {
            return Err(AppError::Auth("Invalid token payload".to_string()));
        }

        Ok(token_data.claims)
    }
}
