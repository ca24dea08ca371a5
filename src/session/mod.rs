//! Session context for the SSO state that crosses requests
//!
//! The session storage implementation belongs to the host; only its
//! string-keyed key/value contract is used here. `SessionContext` wraps
//! that contract with typed accessors for every field of the pending
//! auth state, so no handler touches free-form keys.

use std::sync::Arc;

use http::HeaderMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::RegistrationSettings;
use crate::oauth2::types::ResourceOwnerProfile;

/// Session key for the single-use CSRF state token
const KEY_CSRF_STATE: &str = "sso.oauth2_state";
/// Session key for the redirect URI the state was issued with
const KEY_REDIRECT_URI: &str = "sso.oauth2_redirect_uri";
/// Session key for the remote identity awaiting local linkage
const KEY_REMOTE_ID: &str = "sso.remote_id";
/// Session key for the cached remote profile subset
const KEY_REMOTE_PROFILE: &str = "sso.remote_profile";
/// Session key for the locally linked account id
const KEY_LINKED_ACCOUNT: &str = "sso.linked_account_id";
/// Session key for the remember-me flag recorded at login
const KEY_REMEMBER: &str = "sso.remember_login";
/// Session key for the resolved post-login return target
const KEY_LOGIN_RETURN: &str = "sso.login_return";

/// Collaborator contract of the host's session store
///
/// Process-external, survives the provider redirect round trip.
pub trait SessionStore: Send + Sync {
    /// Read a value, `None` when absent
    fn get(&self, key: &str) -> Option<Value>;
    /// Write a value
    fn set(&self, key: &str, value: Value);
    /// Drop a value
    fn remove(&self, key: &str);
}

/// Collaborator that binds a request to its caller's session store
///
/// The host decides how a caller is identified (normally a session
/// cookie); the engine only asks for the store belonging to this
/// request. Distinct callers must receive distinct stores, or their
/// pending auth states would bleed into each other.
pub trait SessionResolver: Send + Sync {
    /// Store for the caller identified by the request headers
    fn resolve(&self, headers: &HeaderMap) -> Arc<dyn SessionStore>;
}

/// Session-related errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Typed accessors over the session store for the pending auth state
#[derive(Clone)]
pub struct SessionContext {
    store: Arc<dyn SessionStore>,
}

impl SessionContext {
    /// Wrap the host session store
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.store
            .get(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    fn set_typed<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SessionError> {
        self.store.set(key, serde_json::to_value(value)?);
        Ok(())
    }

    /// Raw CSRF state token stored for the in-flight login attempt
    #[must_use]
    pub fn csrf_state(&self) -> Option<String> {
        self.get_typed(KEY_CSRF_STATE)
    }

    /// Persist the raw CSRF state for the login attempt being initiated
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    pub fn set_csrf_state(&self, raw: &str) -> Result<(), SessionError> {
        self.set_typed(KEY_CSRF_STATE, &raw)
    }

    /// Clear the CSRF state and its redirect URI; called after a
    /// successful exchange so the token is single-use
    pub fn clear_csrf_state(&self) {
        self.store.remove(KEY_CSRF_STATE);
        self.store.remove(KEY_REDIRECT_URI);
    }

    /// Redirect URI the in-flight authorization request was issued with
    #[must_use]
    pub fn login_redirect_uri(&self) -> Option<String> {
        self.get_typed(KEY_REDIRECT_URI)
    }

    /// Persist the redirect URI of the login attempt being initiated;
    /// the token exchange must present the identical URI
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    pub fn set_login_redirect_uri(&self, redirect_uri: &str) -> Result<(), SessionError> {
        self.set_typed(KEY_REDIRECT_URI, &redirect_uri)
    }

    /// Remote identity awaiting local-account linkage
    #[must_use]
    pub fn remote_id_pending(&self) -> Option<String> {
        self.get_typed(KEY_REMOTE_ID)
    }

    /// Record the remote identity resolved from the profile fetch
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    pub fn set_remote_id_pending(&self, remote_id: &str) -> Result<(), SessionError> {
        self.set_typed(KEY_REMOTE_ID, &remote_id)
    }

    /// Drop the pending remote identity (refused link or logout)
    pub fn clear_remote_id_pending(&self) {
        self.store.remove(KEY_REMOTE_ID);
    }

    /// Cached subset of the fetched remote profile
    #[must_use]
    pub fn remote_profile(&self) -> Option<ResourceOwnerProfile> {
        self.get_typed(KEY_REMOTE_PROFILE)
    }

    /// Cache the fetched remote profile subset
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    pub fn set_remote_profile(&self, profile: &ResourceOwnerProfile) -> Result<(), SessionError> {
        self.set_typed(KEY_REMOTE_PROFILE, profile)
    }

    /// Local account id recorded once the session's remote identity is
    /// linked
    #[must_use]
    pub fn linked_account_id(&self) -> Option<i64> {
        self.get_typed(KEY_LINKED_ACCOUNT)
    }

    /// Record the session's link to a local account
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    pub fn set_linked_account_id(&self, id: i64) -> Result<(), SessionError> {
        self.set_typed(KEY_LINKED_ACCOUNT, &id)
    }

    /// Remember-me flag recorded at a successful front-end login
    #[must_use]
    pub fn remember_login(&self) -> bool {
        self.get_typed(KEY_REMEMBER).unwrap_or(false)
    }

    /// Record the remember-me flag
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    pub fn set_remember_login(&self, remember: bool) -> Result<(), SessionError> {
        self.set_typed(KEY_REMEMBER, &remember)
    }

    /// Resolved post-login return target, kept in user state so the host
    /// may still adjust it
    #[must_use]
    pub fn login_return(&self) -> Option<String> {
        self.get_typed(KEY_LOGIN_RETURN)
    }

    /// Record the resolved return target
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    pub fn set_login_return(&self, target: &str) -> Result<(), SessionError> {
        self.set_typed(KEY_LOGIN_RETURN, &target)
    }

    /// Registration pre-fill data, available only while a remote
    /// identity is pending and the deployment opted in
    #[must_use]
    pub fn registration_prefill(
        &self,
        settings: &RegistrationSettings,
    ) -> Option<ResourceOwnerProfile> {
        if !settings.define_registration_fields {
            return None;
        }
        self.remote_id_pending()?;
        self.remote_profile()
    }

    /// Clear all SSO session state; called on logout
    pub fn clear_sso(&self) {
        for key in [
            KEY_CSRF_STATE,
            KEY_REDIRECT_URI,
            KEY_REMOTE_ID,
            KEY_REMOTE_PROFILE,
            KEY_LINKED_ACCOUNT,
            KEY_REMEMBER,
            KEY_LOGIN_RETURN,
        ] {
            self.store.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySessionStore;

    fn session() -> SessionContext {
        SessionContext::new(Arc::new(MemorySessionStore::default()))
    }

    #[test]
    fn test_csrf_state_round_trip_and_single_use_clear() {
        let session = session();
        assert!(session.csrf_state().is_none());

        session.set_csrf_state("abc123").unwrap();
        session
            .set_login_redirect_uri("https://www.example.com/login")
            .unwrap();
        assert_eq!(session.csrf_state().as_deref(), Some("abc123"));
        assert_eq!(
            session.login_redirect_uri().as_deref(),
            Some("https://www.example.com/login")
        );

        // the redirect URI lives and dies with the state token
        session.clear_csrf_state();
        assert!(session.csrf_state().is_none());
        assert!(session.login_redirect_uri().is_none());
    }

    #[test]
    fn test_clear_sso_drops_every_field() {
        let session = session();
        session.set_csrf_state("s").unwrap();
        session.set_remote_id_pending("ext-1").unwrap();
        session.set_linked_account_id(9).unwrap();
        session.set_remember_login(true).unwrap();

        session.clear_sso();

        assert!(session.csrf_state().is_none());
        assert!(session.remote_id_pending().is_none());
        assert!(session.linked_account_id().is_none());
        assert!(!session.remember_login());
    }

    #[test]
    fn test_registration_prefill_requires_opt_in_and_pending_identity() {
        let session = session();
        let profile = ResourceOwnerProfile {
            id: "ext-1".to_string(),
            name: Some("Jo".to_string()),
            username: Some("jo".to_string()),
            email: Some("jo@example.com".to_string()),
        };
        session.set_remote_profile(&profile).unwrap();

        let opted_out = RegistrationSettings {
            allow_registration: true,
            define_registration_fields: false,
        };
        let opted_in = RegistrationSettings {
            allow_registration: true,
            define_registration_fields: true,
        };

        // opted out: no prefill even with a cached profile
        assert!(session.registration_prefill(&opted_out).is_none());

        // opted in but no pending remote identity: still nothing
        assert!(session.registration_prefill(&opted_in).is_none());

        session.set_remote_id_pending("ext-1").unwrap();
        assert_eq!(session.registration_prefill(&opted_in), Some(profile));
    }
}
