//! Shared application state and router assembly
//!
//! `AppState` wires the configuration, the OAuth2 client, and every
//! host collaborator together, and builds the axum router with the
//! session binding and the callback guard layered over all routes.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use http::HeaderMap;
use tower_http::trace::TraceLayer;

use crate::accounts::LocalAccountStore;
use crate::auth::events::AuthEventPipeline;
use crate::auth::handler::{auth_action, AuthRequestHandler};
use crate::auth::linker::SessionLinker;
use crate::auth::redirect::MenuLanguageLookup;
use crate::config::{DeploymentContext, SsoConfig};
use crate::error::SsoError;
use crate::oauth2::callback::{callback_guard, CallbackStateMachine};
use crate::oauth2::client::{OAuth2Client, ProfileFetcher, TokenExchanger};
use crate::session::{SessionContext, SessionResolver};
use crate::xref::IdentityLinkRepository;

/// Shared state for the SSO router; cheap to clone
#[derive(Clone)]
pub struct AppState {
    config: Arc<SsoConfig>,
    context: DeploymentContext,
    sessions: Arc<dyn SessionResolver>,
    identity_links: Arc<dyn IdentityLinkRepository>,
    accounts: Arc<dyn LocalAccountStore>,
    events: Arc<dyn AuthEventPipeline>,
    menu_languages: Arc<dyn MenuLanguageLookup>,
    exchanger: Arc<dyn TokenExchanger>,
    profiles: Arc<dyn ProfileFetcher>,
}

impl AppState {
    /// Assemble the state for one deployment context.
    ///
    /// The provider-backed OAuth2 client serves as both token exchanger
    /// and profile fetcher unless overridden.
    #[must_use]
    pub fn new(
        config: SsoConfig,
        context: DeploymentContext,
        sessions: Arc<dyn SessionResolver>,
        identity_links: Arc<dyn IdentityLinkRepository>,
        accounts: Arc<dyn LocalAccountStore>,
        events: Arc<dyn AuthEventPipeline>,
        menu_languages: Arc<dyn MenuLanguageLookup>,
    ) -> Self {
        let oauth = Arc::new(OAuth2Client::new(config.provider.clone(), context));
        Self {
            config: Arc::new(config),
            context,
            sessions,
            identity_links,
            accounts,
            events,
            menu_languages,
            exchanger: Arc::clone(&oauth) as Arc<dyn TokenExchanger>,
            profiles: oauth,
        }
    }

    /// Replace the token exchanger; used by tests and by hosts fronting
    /// the provider with their own transport
    #[must_use]
    pub fn with_token_exchanger(mut self, exchanger: Arc<dyn TokenExchanger>) -> Self {
        self.exchanger = exchanger;
        self
    }

    /// Replace the profile fetcher
    #[must_use]
    pub fn with_profile_fetcher(mut self, profiles: Arc<dyn ProfileFetcher>) -> Self {
        self.profiles = profiles;
        self
    }

    /// Deployment configuration
    #[must_use]
    pub fn config(&self) -> &SsoConfig {
        &self.config
    }

    /// Deployment context this state was assembled for
    #[must_use]
    pub const fn context(&self) -> DeploymentContext {
        self.context
    }

    /// Session of the caller identified by the request headers
    #[must_use]
    pub fn session_for(&self, headers: &HeaderMap) -> SessionContext {
        SessionContext::new(self.sessions.resolve(headers))
    }

    /// Callback state machine for the current context
    #[must_use]
    pub fn callback_machine(&self) -> CallbackStateMachine {
        CallbackStateMachine::new(
            self.context,
            Arc::clone(&self.exchanger),
            self.config.routing.base_url.clone(),
        )
    }

    /// Auth action handler with every collaborator wired in
    #[must_use]
    pub fn auth_handler(&self) -> AuthRequestHandler {
        AuthRequestHandler::new(
            Arc::clone(&self.config),
            self.context,
            Arc::clone(&self.profiles),
            Arc::clone(&self.identity_links),
            Arc::clone(&self.accounts),
            Arc::clone(&self.events),
            Arc::clone(&self.menu_languages),
        )
    }

    /// Linker for the account-saved and login hooks, bound to one
    /// caller's session
    #[must_use]
    pub fn linker(&self, session: SessionContext) -> SessionLinker {
        SessionLinker::new(
            session,
            Arc::clone(&self.identity_links),
            Arc::clone(&self.accounts),
        )
    }

    /// Start a login attempt for one caller: persist the raw CSRF state
    /// with the redirect URI and return the provider authorize URL for
    /// the popup.
    ///
    /// # Errors
    ///
    /// Returns error if the provider endpoint is not a valid URL or the
    /// session write fails.
    pub fn begin_login(
        &self,
        session: &SessionContext,
        redirect_uri: &str,
    ) -> Result<String, SsoError> {
        let oauth = OAuth2Client::new(self.config.provider.clone(), self.context);
        let (url, state) = oauth.build_authorization_request(redirect_uri)?;
        session.set_csrf_state(&state.raw)?;
        session.set_login_redirect_uri(redirect_uri)?;
        Ok(url)
    }

    /// Build the router: the auth action plus the session binding and
    /// callback guard over every route, including unmatched paths
    #[must_use]
    pub fn router(self) -> Router {
        Router::new()
            .route("/auth", any(auth_action))
            .fallback(|| async { StatusCode::NOT_FOUND })
            .layer(middleware::from_fn_with_state(self.clone(), callback_guard))
            .layer(middleware::from_fn_with_state(self.clone(), bind_session))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }
}

/// Middleware resolving the caller's session and handing it to the
/// inner layers through request extensions
async fn bind_session(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let session = state.session_for(req.headers());
    req.extensions_mut().insert(session);
    next.run(req).await
}
