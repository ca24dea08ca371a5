//! Local account store collaborator
//!
//! The host CMS owns local accounts; the engine only loads them by id
//! when a cross-reference resolves, and maps a username back to an id
//! when the login trigger fires.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Local account subset the engine needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAccount {
    /// Local account id
    pub id: i64,
    /// Login name
    pub username: String,
    /// Preferred content language, if set
    pub language: Option<String>,
}

/// Collaborator contract of the host's account store
#[async_trait]
pub trait LocalAccountStore: Send + Sync {
    /// Load an account by id; `None` when it does not exist
    async fn load_by_id(&self, id: i64) -> Result<Option<LocalAccount>, sqlx::Error>;

    /// Resolve a username to an account id; `None` when unknown
    async fn id_for_username(&self, username: &str) -> Result<Option<i64>, sqlx::Error>;
}
