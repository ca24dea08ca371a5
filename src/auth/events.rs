//! Authentication-event pipeline collaborator
//!
//! The host's login policy lives behind this seam: the login event may
//! be vetoed (for instance, for a disabled account), and the veto is
//! surfaced as a generic rejection, never a silent success.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DeploymentContext;

/// Dispatched before a local login completes; any subscriber may veto
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginEvent {
    /// Local username being logged in
    pub username: String,
    /// Account's content language, if set
    pub language: Option<String>,
    /// Remember-me flag from the client
    pub remember: bool,
    /// Deployment context of the login
    pub context: DeploymentContext,
}

/// Dispatched after a successful local login
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AfterLoginEvent {
    /// Local account id
    pub account_id: i64,
    /// Local username
    pub username: String,
}

/// Dispatched when the login event was vetoed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginFailureEvent {
    /// Local username whose login failed
    pub username: String,
}

/// Collaborator contract of the host's authentication-event pipeline
#[async_trait]
pub trait AuthEventPipeline: Send + Sync {
    /// Dispatch the login event; returns `true` when any subscriber
    /// vetoed the login
    async fn dispatch_login(&self, event: &LoginEvent) -> bool;

    /// Dispatch the after-login event
    async fn dispatch_after_login(&self, event: &AfterLoginEvent);

    /// Dispatch the login-failure event
    async fn dispatch_login_failure(&self, event: &LoginFailureEvent);
}

/// Pipeline that accepts every login; the default when the host wires
/// no policy
pub struct NullEventPipeline;

#[async_trait]
impl AuthEventPipeline for NullEventPipeline {
    async fn dispatch_login(&self, _event: &LoginEvent) -> bool {
        false
    }

    async fn dispatch_after_login(&self, _event: &AfterLoginEvent) {}

    async fn dispatch_login_failure(&self, _event: &LoginFailureEvent) {}
}
