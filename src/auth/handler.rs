//! The auth action: token-to-login exchange
//!
//! The client posts the access token obtained in the popup; this handler
//! resolves the remote identity, loads or creates the cross-reference,
//! and decides login vs. register vs. reject. Every failure is caught at
//! the top level and converted to the structured JSON envelope.

use std::sync::Arc;

use axum::extract::{FromRequest, Multipart, Query, Request, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::accounts::LocalAccountStore;
use crate::auth::events::{AfterLoginEvent, AuthEventPipeline, LoginEvent, LoginFailureEvent};
use crate::auth::linker::SessionLinker;
use crate::auth::redirect::{
    decode_return, resolve_admin_return, resolve_site_return, MenuLanguageLookup,
};
use crate::config::{DeploymentContext, SsoConfig};
use crate::error::SsoError;
use crate::oauth2::client::ProfileFetcher;
use crate::oauth2::types::AccessTokenPayload;
use crate::session::SessionContext;
use crate::state::AppState;
use crate::xref::IdentityLinkRepository;

/// Parsed auth action request
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// Provider token structure from the client exchange
    pub access_token: AccessTokenPayload,
    /// Base64-encoded redirect hint
    pub return_hint: String,
    /// Remember-me flag
    pub remember: bool,
}

/// Successful outcome of the auth action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The remote identity is linked; the login completed
    LoggedIn {
        /// Resolved post-login redirect target
        redirect: String,
    },
    /// First-time remote identity and self-registration is open; the
    /// client routes to the registration form on this message
    RegistrationAllowed {
        /// Distinguishable registration-allowed message
        message: String,
    },
}

/// Server endpoint deciding login vs. register vs. reject
pub struct AuthRequestHandler {
    config: Arc<SsoConfig>,
    context: DeploymentContext,
    profiles: Arc<dyn ProfileFetcher>,
    identity_links: Arc<dyn IdentityLinkRepository>,
    accounts: Arc<dyn LocalAccountStore>,
    events: Arc<dyn AuthEventPipeline>,
    menu_languages: Arc<dyn MenuLanguageLookup>,
}

impl AuthRequestHandler {
    /// Create a handler with explicit dependencies; the deployment
    /// context is fixed at construction, never inferred mid-request
    #[must_use]
    pub fn new(
        config: Arc<SsoConfig>,
        context: DeploymentContext,
        profiles: Arc<dyn ProfileFetcher>,
        identity_links: Arc<dyn IdentityLinkRepository>,
        accounts: Arc<dyn LocalAccountStore>,
        events: Arc<dyn AuthEventPipeline>,
        menu_languages: Arc<dyn MenuLanguageLookup>,
    ) -> Self {
        Self {
            config,
            context,
            profiles,
            identity_links,
            accounts,
            events,
            menu_languages,
        }
    }

    /// Run the auth exchange for one request.
    ///
    /// # Errors
    ///
    /// Returns the full taxonomy: provider errors, the
    /// registration-disallowed `AccountNotFound`, fatal inconsistencies,
    /// and pipeline rejections.
    pub async fn authenticate(
        &self,
        session: &SessionContext,
        request: AuthRequest,
    ) -> Result<AuthOutcome, SsoError> {
        let profile = self
            .profiles
            .fetch_resource_owner_profile(&request.access_token.access_token)
            .await?;

        session.set_remote_id_pending(&profile.id)?;
        session.set_remote_profile(&profile)?;

        // The bearer token itself is never logged
        tracing::info!(remote_id = %profile.id, "auth exchange for remote identity");

        let link = match self.identity_links.find_by_remote_id(&profile.id).await? {
            Some(link) => link,
            None => self.identity_links.insert(&profile.id).await?,
        };

        match link.local_account_id {
            Some(local_account_id) => self.login(session, &request, local_account_id).await,
            None => self.first_time_identity(),
        }
    }

    /// Linked identity: complete the local login through the host's
    /// login policy
    async fn login(
        &self,
        session: &SessionContext,
        request: &AuthRequest,
        local_account_id: i64,
    ) -> Result<AuthOutcome, SsoError> {
        let account = self
            .accounts
            .load_by_id(local_account_id)
            .await?
            .ok_or(SsoError::LinkedAccountMissing)?;

        let decoded = decode_return(&request.return_hint);
        let redirect = if self.context.is_admin() {
            resolve_admin_return(&decoded, &self.config.routing.base_url)
        } else {
            let resolved = resolve_site_return(
                &decoded,
                &self.config.routing.base_url,
                self.config.routing.multilingual,
                self.menu_languages.as_ref(),
            )
            .await?;
            // kept in user state so the host may still adjust it
            session.set_login_return(&resolved)?;
            resolved
        };

        let vetoed = self
            .events
            .dispatch_login(&LoginEvent {
                username: account.username.clone(),
                language: account.language.clone(),
                remember: request.remember,
                context: self.context,
            })
            .await;

        if vetoed {
            self.events
                .dispatch_login_failure(&LoginFailureEvent {
                    username: account.username.clone(),
                })
                .await;
            return Err(SsoError::LoginRejected);
        }

        self.events
            .dispatch_after_login(&AfterLoginEvent {
                account_id: account.id,
                username: account.username.clone(),
            })
            .await;

        if !self.context.is_admin() && request.remember {
            session.set_remember_login(true)?;
        }

        // Login completed: record the session's link (fast path; the
        // cross-reference already points at this account)
        let linker = SessionLinker::new(
            session.clone(),
            Arc::clone(&self.identity_links),
            Arc::clone(&self.accounts),
        );
        linker.on_login_completed(&account.username).await?;

        let redirect = session.login_return().unwrap_or(redirect);
        tracing::info!(username = %account.username, redirect = %redirect, "redirecting to after-login page");
        Ok(AuthOutcome::LoggedIn { redirect })
    }

    /// First-time remote identity: registration routing or rejection
    fn first_time_identity(&self) -> Result<AuthOutcome, SsoError> {
        if self.context.is_admin() || !self.config.registration.allow_registration {
            return Err(SsoError::AccountNotFound {
                registration_allowed: false,
            });
        }

        Ok(AuthOutcome::RegistrationAllowed {
            message: SsoError::AccountNotFound {
                registration_allowed: true,
            }
            .to_string(),
        })
    }
}

/// Query parameters of the auth action
#[derive(Debug, Deserialize)]
struct AuthActionQuery {
    task: Option<String>,
}

/// JSON body shape of the auth action
#[derive(Debug, Deserialize)]
struct AuthBody {
    access_token: AccessTokenPayload,
    #[serde(default, rename = "return")]
    return_hint: String,
    #[serde(default)]
    remember: bool,
}

/// Parse the auth POST body: multipart/form-data from the widget, JSON
/// from everything else
async fn parse_auth_request(req: Request) -> Result<AuthRequest, SsoError> {
    let content_type = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(req, &())
            .await
            .map_err(|e| SsoError::BadRequest(format!("malformed multipart body: {e}")))?;

        let mut access_token = None;
        let mut return_hint = String::new();
        let mut remember = false;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| SsoError::BadRequest(format!("malformed multipart body: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            let text = field
                .text()
                .await
                .map_err(|e| SsoError::BadRequest(format!("malformed multipart field: {e}")))?;

            match name.as_str() {
                "access_token" => {
                    access_token = Some(serde_json::from_str::<AccessTokenPayload>(&text).map_err(
                        |e| SsoError::BadRequest(format!("malformed access_token: {e}")),
                    )?);
                }
                "return" => return_hint = text,
                "remember" => remember = matches!(text.as_str(), "1" | "true" | "on" | "yes"),
                _ => {}
            }
        }

        Ok(AuthRequest {
            access_token: access_token
                .ok_or_else(|| SsoError::BadRequest("missing access_token".to_string()))?,
            return_hint,
            remember,
        })
    } else {
        let Json(body) = Json::<AuthBody>::from_request(req, &())
            .await
            .map_err(|e| SsoError::BadRequest(format!("malformed JSON body: {e}")))?;
        Ok(AuthRequest {
            access_token: body.access_token,
            return_hint: body.return_hint,
            remember: body.remember,
        })
    }
}

/// Axum entry point for the auth action
///
/// POST-only; every error becomes the structured envelope, with trace
/// and raw provider body included only on debug deployments.
pub async fn auth_action(State(state): State<AppState>, req: Request) -> Response {
    let debug = state.config().debug;

    let result = async {
        if req.method() != http::Method::POST {
            return Err(SsoError::MethodNotAllowed);
        }

        match Query::<AuthActionQuery>::try_from_uri(req.uri()) {
            Ok(Query(query)) if query.task.as_deref() == Some("auth") => {}
            _ => return Err(SsoError::BadRequest("unknown task".to_string())),
        }

        let session = req
            .extensions()
            .get::<SessionContext>()
            .cloned()
            .unwrap_or_else(|| state.session_for(req.headers()));
        let request = parse_auth_request(req).await?;
        state.auth_handler().authenticate(&session, request).await
    }
    .await;

    match result {
        Ok(AuthOutcome::LoggedIn { redirect }) => Json(json!({
            "success": true,
            "data": { "redirect": redirect },
        }))
        .into_response(),
        Ok(AuthOutcome::RegistrationAllowed { message }) => Json(json!({
            "success": true,
            "message": message,
            "data": { "registration_allowed": true },
        }))
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "auth action failed");
            err.into_envelope(debug)
        }
    }
}
