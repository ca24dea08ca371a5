//! Single sign-on bridge between an OAuth2 identity provider and a
//! host CMS's local accounts.
//!
//! The engine covers the full federation flow: it issues
//! context-prefixed CSRF state for the popup authorization request,
//! intercepts the provider callback on any route and exchanges the code
//! for tokens, resolves the remote profile, and maps the remote
//! identity onto a local account through a durable cross-reference
//! table. First-time identities are routed to registration when the
//! deployment allows it, and logins pass through the host's event
//! pipeline so local policy can still veto them.
//!
//! Host integration happens through collaborator traits: session
//! storage, the account store, the cross-reference repository, the
//! event pipeline, and the menu-language lookup are all seams the host
//! implements. Postgres-backed implementations exist for the storage
//! seams, and [`testing`] ships in-memory doubles for the rest.
//!
//! A deployment wires one [`state::AppState`] per context (public site
//! or administrator console); the context decides callback replay,
//! registration policy, and post-login routing.

pub mod accounts;
pub mod auth;
pub mod config;
pub mod error;
pub mod oauth2;
pub mod session;
pub mod state;
pub mod testing;
pub mod xref;

pub use accounts::{LocalAccount, LocalAccountStore};
pub use config::{DeploymentContext, SsoConfig};
pub use error::SsoError;
pub use state::AppState;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the structured logging subscriber.
///
/// Hosts embedding the engine in a larger service should install their
/// own subscriber instead; this is the standalone default, filtered by
/// `RUST_LOG` with an info-level fallback.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
