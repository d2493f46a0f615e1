use async_trait::async_trait;

use crate::types::ApiError;

/// Source of bearer tokens, asked once per remote call so that rotated or
/// refreshed credentials are picked up without restarting anything.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, ApiError>;
}

/// Fixed token, e.g. a service-account key exchanged once at startup.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, ApiError> {
        if self.0.is_empty() {
            return Err(ApiError::Unauthenticated("empty token".to_string()));
        }
        Ok(self.0.clone())
    }
}
