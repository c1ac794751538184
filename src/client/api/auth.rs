//! Authentication API trait

use async_trait::async_trait;

use crate::client::models::{Credentials, TokenInfo};
use crate::error::Result;

/// Authentication operations provided by the backend
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Current session token expiry, or `None` when there is no session
    async fn get_session(&self) -> Result<Option<TokenInfo>>;

    /// Ask the backend for a fresh token; `false` when it refused
    async fn refresh_session(&self) -> Result<bool>;

    /// End the remote session
    async fn logout(&self) -> Result<()>;

    /// Start a session; `false` for rejected credentials
    async fn login(&self, credentials: &Credentials) -> Result<bool>;
}
