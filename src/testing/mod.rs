//! In-memory collaborator implementations for tests
//!
//! Every host seam has a deterministic in-memory double here. They live
//! in the crate proper so integration tests and downstream hosts can
//! reuse them when wiring the engine without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use crate::accounts::{LocalAccount, LocalAccountStore};
use crate::auth::events::{
    AfterLoginEvent, AuthEventPipeline, LoginEvent, LoginFailureEvent,
};
use crate::auth::redirect::MenuLanguageLookup;
use crate::oauth2::client::{ProfileFetcher, TokenExchanger};
use crate::oauth2::types::{OAuthError, ResourceOwnerProfile};
use crate::session::{SessionContext, SessionResolver, SessionStore};
use crate::xref::{IdentityLink, IdentityLinkRepository};

/// Hash-map session store
#[derive(Default)]
pub struct MemorySessionStore {
    values: Mutex<HashMap<String, Value>>,
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.values.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }
}

/// Session resolver keying callers on the `Cookie` header verbatim
///
/// Each distinct cookie value (including its absence) gets its own
/// [`MemorySessionStore`], which is what a cookie-based host does with
/// real session ids.
#[derive(Default)]
pub struct MemorySessions {
    stores: Mutex<HashMap<String, Arc<MemorySessionStore>>>,
}

impl MemorySessions {
    fn store(&self, key: &str) -> Arc<MemorySessionStore> {
        Arc::clone(
            self.stores
                .lock()
                .entry(key.to_string())
                .or_default(),
        )
    }

    /// Direct handle on one caller's session, for seeding and asserting
    #[must_use]
    pub fn handle(&self, cookie: &str) -> SessionContext {
        SessionContext::new(self.store(cookie))
    }
}

impl SessionResolver for MemorySessions {
    fn resolve(&self, headers: &http::HeaderMap) -> Arc<dyn SessionStore> {
        let key = headers
            .get(http::header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        self.store(key)
    }
}

/// Hash-map cross-reference repository with the same convergence and
/// immutability behavior as the Postgres one
#[derive(Default)]
pub struct MemoryIdentityLinkRepository {
    rows: Mutex<HashMap<String, IdentityLink>>,
}

impl MemoryIdentityLinkRepository {
    /// Number of stored rows
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }
}

#[async_trait]
impl IdentityLinkRepository for MemoryIdentityLinkRepository {
    async fn find_by_remote_id(
        &self,
        remote_id: &str,
    ) -> Result<Option<IdentityLink>, sqlx::Error> {
        Ok(self.rows.lock().get(remote_id).cloned())
    }

    async fn find_by_local_account_id(
        &self,
        local_account_id: i64,
    ) -> Result<Option<IdentityLink>, sqlx::Error> {
        Ok(self
            .rows
            .lock()
            .values()
            .find(|row| row.local_account_id == Some(local_account_id))
            .cloned())
    }

    async fn insert(&self, remote_id: &str) -> Result<IdentityLink, sqlx::Error> {
        let mut rows = self.rows.lock();
        // a lost race returns the winner's row, like ON CONFLICT DO
        // NOTHING plus reload
        let row = rows
            .entry(remote_id.to_string())
            .or_insert_with(|| IdentityLink {
                remote_id: remote_id.to_string(),
                local_account_id: None,
                created_at: Utc::now(),
            });
        Ok(row.clone())
    }

    async fn update_local_account_id(
        &self,
        remote_id: &str,
        local_account_id: i64,
    ) -> Result<bool, sqlx::Error> {
        let mut rows = self.rows.lock();
        match rows.get_mut(remote_id) {
            Some(row) if row.local_account_id.is_none() => {
                row.local_account_id = Some(local_account_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Hash-map local-account store
#[derive(Default)]
pub struct MemoryLocalAccountStore {
    accounts: Mutex<Vec<LocalAccount>>,
}

impl MemoryLocalAccountStore {
    /// Register an account
    pub fn add(&self, account: LocalAccount) {
        self.accounts.lock().push(account);
    }
}

#[async_trait]
impl LocalAccountStore for MemoryLocalAccountStore {
    async fn load_by_id(&self, id: i64) -> Result<Option<LocalAccount>, sqlx::Error> {
        Ok(self
            .accounts
            .lock()
            .iter()
            .find(|account| account.id == id)
            .cloned())
    }

    async fn id_for_username(&self, username: &str) -> Result<Option<i64>, sqlx::Error> {
        Ok(self
            .accounts
            .lock()
            .iter()
            .find(|account| account.username == username)
            .map(|account| account.id))
    }
}

/// Fixed menu-item language table
#[derive(Default)]
pub struct StaticMenuLanguages {
    items: HashMap<i64, String>,
}

impl StaticMenuLanguages {
    /// Build a table from `(item id, language)` pairs
    #[must_use]
    pub fn with_items<'a>(items: impl IntoIterator<Item = (i64, &'a str)>) -> Self {
        Self {
            items: items
                .into_iter()
                .map(|(id, lang)| (id, lang.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl MenuLanguageLookup for StaticMenuLanguages {
    async fn language_for_item(&self, item_id: i64) -> Result<Option<String>, sqlx::Error> {
        Ok(self.items.get(&item_id).cloned())
    }
}

/// Event pipeline that counts dispatches and optionally vetoes the next
/// login
#[derive(Default)]
pub struct RecordingEventPipeline {
    veto_next: AtomicBool,
    logins: AtomicUsize,
    after_logins: AtomicUsize,
    failures: AtomicUsize,
    last_login: Mutex<Option<LoginEvent>>,
}

impl RecordingEventPipeline {
    /// Veto the next dispatched login
    pub fn veto_next_login(&self) {
        self.veto_next.store(true, Ordering::SeqCst);
    }

    /// Number of login events seen
    #[must_use]
    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    /// Number of after-login events seen
    #[must_use]
    pub fn after_login_count(&self) -> usize {
        self.after_logins.load(Ordering::SeqCst)
    }

    /// Number of login-failure events seen
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// The most recent login event
    #[must_use]
    pub fn last_login(&self) -> Option<LoginEvent> {
        self.last_login.lock().clone()
    }
}

#[async_trait]
impl AuthEventPipeline for RecordingEventPipeline {
    async fn dispatch_login(&self, event: &LoginEvent) -> bool {
        self.logins.fetch_add(1, Ordering::SeqCst);
        *self.last_login.lock() = Some(event.clone());
        self.veto_next.swap(false, Ordering::SeqCst)
    }

    async fn dispatch_after_login(&self, _event: &AfterLoginEvent) {
        self.after_logins.fetch_add(1, Ordering::SeqCst);
    }

    async fn dispatch_login_failure(&self, _event: &LoginFailureEvent) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Token exchanger answering from a canned code-to-token map
#[derive(Default)]
pub struct CannedTokenExchanger {
    responses: Mutex<HashMap<String, Value>>,
    last_redirect_uri: Mutex<Option<String>>,
}

impl CannedTokenExchanger {
    /// Map an authorization code to a token response
    pub fn set_response(&self, code: &str, response: Value) {
        self.responses.lock().insert(code.to_string(), response);
    }

    /// Redirect URI presented on the most recent exchange
    #[must_use]
    pub fn last_redirect_uri(&self) -> Option<String> {
        self.last_redirect_uri.lock().clone()
    }
}

#[async_trait]
impl TokenExchanger for CannedTokenExchanger {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Value, OAuthError> {
        *self.last_redirect_uri.lock() = Some(redirect_uri.to_string());
        self.responses
            .lock()
            .get(code)
            .cloned()
            .ok_or_else(|| OAuthError::Exchange {
                message: format!("unknown authorization code: {code}"),
                body: Some(r#"{"error":"invalid_grant"}"#.to_string()),
            })
    }
}

/// Profile fetcher answering from a canned token-to-profile map
#[derive(Default)]
pub struct CannedProfileFetcher {
    profiles: Mutex<HashMap<String, ResourceOwnerProfile>>,
}

impl CannedProfileFetcher {
    /// Map an access token to a resource-owner profile
    pub fn set_profile(&self, access_token: &str, profile: ResourceOwnerProfile) {
        self.profiles
            .lock()
            .insert(access_token.to_string(), profile);
    }
}

#[async_trait]
impl ProfileFetcher for CannedProfileFetcher {
    async fn fetch_resource_owner_profile(
        &self,
        access_token: &str,
    ) -> Result<ResourceOwnerProfile, OAuthError> {
        self.profiles
            .lock()
            .get(access_token)
            .cloned()
            .ok_or_else(|| OAuthError::Profile {
                message: "access token not recognized by the provider".to_string(),
                body: Some(r#"{"error":"invalid_token"}"#.to_string()),
            })
    }
}
