//! OAuth2 redirect-callback state machine
//!
//! The provider redirects the popup back to an arbitrary route carrying
//! `state` and either `code` or `error`/`error_description`. The state
//! machine validates the context prefix, correlates the raw state with
//! the session, exchanges the code, and hands the resulting token or
//! error payload to the opening window over the same-origin
//! `window.opener` channel. A state that does not match the session is
//! deliberately NOT an error: the request falls through to normal
//! routing.

use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Redirect, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::DeploymentContext;
use crate::oauth2::client::TokenExchanger;
use crate::oauth2::types::{CsrfState, ProviderErrorPayload};
use crate::session::SessionContext;
use crate::state::AppState;

/// Callback query parameters
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    /// Context-prefixed CSRF state token
    pub state: Option<String>,
    /// Authorization code, on provider success
    pub code: Option<String>,
    /// Provider error code, on provider failure
    pub error: Option<String>,
    /// Provider error description
    pub error_description: Option<String>,
}

/// Outcome of evaluating a callback request
#[derive(Debug, PartialEq, Eq)]
pub enum CallbackAction {
    /// Not a callback for this session; fall through to normal routing
    PassThrough,
    /// State was issued under another deployment context; replay there
    ReplayInContext {
        /// Redirect target preserving the callback query
        location: String,
    },
    /// Terminate the response with this payload for the opener window
    Respond {
        /// Token JSON or provider error payload
        payload: Value,
    },
}

/// Validates callbacks and drives the code-for-token exchange
pub struct CallbackStateMachine {
    context: DeploymentContext,
    exchanger: Arc<dyn TokenExchanger>,
    /// Deployment root used to reconstruct the redirect URI
    base_url: String,
}

impl CallbackStateMachine {
    /// Create a state machine for the given deployment context
    #[must_use]
    pub fn new(
        context: DeploymentContext,
        exchanger: Arc<dyn TokenExchanger>,
        base_url: String,
    ) -> Self {
        Self {
            context,
            exchanger,
            base_url,
        }
    }

    /// Evaluate one callback request.
    ///
    /// `request_path` and `request_query` come from the incoming URI and
    /// are used for the context replay target and the token-exchange
    /// redirect URI. Provider and exchange failures surface as error
    /// payloads for the opener, never as faults.
    pub async fn evaluate(
        &self,
        session: &SessionContext,
        params: &CallbackParams,
        request_path: &str,
        request_query: &str,
    ) -> CallbackAction {
        let Some(state) = params.state.as_deref() else {
            return CallbackAction::PassThrough;
        };

        // No context prefix: not one of ours
        let Some((context_name, raw_state)) = CsrfState::split(state) else {
            return CallbackAction::PassThrough;
        };

        if context_name != self.context.as_str() {
            // The state was generated under a different deployment
            // context; replay the callback at that context's base path.
            let path = if context_name == DeploymentContext::Site.as_str() {
                "/".to_string()
            } else {
                format!("/{context_name}")
            };
            tracing::debug!(context = context_name, "replaying callback in issuing context");
            return CallbackAction::ReplayInContext {
                location: format!("{path}?{request_query}"),
            };
        }

        match session.csrf_state() {
            Some(stored) if stored == raw_state => {}
            _ => {
                // Attacker-supplied or stale state must never trigger an
                // exchange; fall through silently.
                tracing::trace!("callback state does not match session; ignoring");
                return CallbackAction::PassThrough;
            }
        }

        let payload = if let Some(code) = params.code.as_deref() {
            // Providers enforcing exact redirect-URI matching require the
            // authorize-time URI; the reconstruction is a fallback for
            // sessions predating it
            let redirect_uri = session.login_redirect_uri().unwrap_or_else(|| {
                format!("{}{}", self.base_url.trim_end_matches('/'), request_path)
            });
            match self.exchanger.exchange_code(code, &redirect_uri).await {
                Ok(token) => {
                    // Single-use: the raw state is dead after one exchange
                    session.clear_csrf_state();
                    token
                }
                Err(err) => {
                    tracing::warn!(error = %err, "provider token exchange failed");
                    json!({
                        "error": "token_exchange_failed",
                        "error_description": err.to_string(),
                    })
                }
            }
        } else {
            let error = ProviderErrorPayload {
                error: params.error.clone(),
                error_description: params.error_description.clone(),
            };
            tracing::warn!(error = ?error.error, "provider returned an error on callback");
            json!(error)
        };

        CallbackAction::Respond { payload }
    }
}

/// Render the popup page that posts the payload to the opener window
/// and closes itself
#[must_use]
pub fn popup_response(payload: &Value) -> Response {
    let json = serde_json::to_string(payload)
        .unwrap_or_else(|_| "null".to_string())
        .replace("</", "<\\/");

    Html(format!(
        "<!DOCTYPE html>\n<html><body><script>\n\
         window.opener.sso_response = {json};\n\
         window.close();\n\
         </script></body></html>"
    ))
    .into_response()
}

/// Middleware guarding every route for OAuth2 callbacks
///
/// Runs the state machine whenever a GET request carries a `state`
/// query parameter; everything else continues into the router.
pub async fn callback_guard(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if req.method() != http::Method::GET {
        return next.run(req).await;
    }

    let params = match Query::<CallbackParams>::try_from_uri(req.uri()) {
        Ok(Query(params)) if params.state.is_some() => params,
        _ => return next.run(req).await,
    };

    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let session = req
        .extensions()
        .get::<SessionContext>()
        .cloned()
        .unwrap_or_else(|| state.session_for(req.headers()));

    match state
        .callback_machine()
        .evaluate(&session, &params, &path, &query)
        .await
    {
        CallbackAction::PassThrough => next.run(req).await,
        CallbackAction::ReplayInContext { location } => Redirect::to(&location).into_response(),
        CallbackAction::Respond { payload } => popup_response(&payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth2::types::OAuthError;
    use crate::testing::{CannedTokenExchanger, MemorySessionStore};
    use async_trait::async_trait;

    fn session() -> SessionContext {
        SessionContext::new(Arc::new(MemorySessionStore::default()))
    }

    fn machine(exchanger: Arc<dyn TokenExchanger>) -> CallbackStateMachine {
        CallbackStateMachine::new(
            DeploymentContext::Site,
            exchanger,
            "https://www.example.com/".to_string(),
        )
    }

    fn params(state: &str) -> CallbackParams {
        CallbackParams {
            state: Some(state.to_string()),
            ..CallbackParams::default()
        }
    }

    #[tokio::test]
    async fn test_state_without_prefix_passes_through() {
        let machine = machine(Arc::new(CannedTokenExchanger::default()));
        let action = machine
            .evaluate(&session(), &params("rawonly"), "/", "state=rawonly")
            .await;
        assert_eq!(action, CallbackAction::PassThrough);
    }

    #[tokio::test]
    async fn test_wrong_context_is_replayed_with_query() {
        let machine = machine(Arc::new(CannedTokenExchanger::default()));
        let query = "state=administrator-abc&code=xyz";
        let action = machine
            .evaluate(&session(), &params("administrator-abc"), "/", query)
            .await;
        assert_eq!(
            action,
            CallbackAction::ReplayInContext {
                location: format!("/administrator?{query}"),
            }
        );
    }

    #[tokio::test]
    async fn test_site_context_replay_targets_root() {
        let exchanger = Arc::new(CannedTokenExchanger::default());
        let admin = CallbackStateMachine::new(
            DeploymentContext::Administrator,
            exchanger,
            "https://www.example.com/".to_string(),
        );
        let query = "state=site-abc&code=xyz";
        let action = admin
            .evaluate(&session(), &params("site-abc"), "/administrator", query)
            .await;
        assert_eq!(
            action,
            CallbackAction::ReplayInContext {
                location: format!("/?{query}"),
            }
        );
    }

    #[tokio::test]
    async fn test_mismatched_state_is_silent_pass_through() {
        let machine = machine(Arc::new(CannedTokenExchanger::default()));
        let session = session();
        session.set_csrf_state("expected").unwrap();

        let mut p = params("site-attacker");
        p.code = Some("stolen".to_string());
        let action = machine.evaluate(&session, &p, "/", "").await;

        assert_eq!(action, CallbackAction::PassThrough);
        // state is untouched; no exchange happened
        assert_eq!(session.csrf_state().as_deref(), Some("expected"));
    }

    #[tokio::test]
    async fn test_matching_state_exchanges_code_and_clears_state() {
        let exchanger = Arc::new(CannedTokenExchanger::default());
        exchanger.set_response("code-1", json!({"access_token": "tok", "token_type": "Bearer"}));
        let machine = machine(exchanger);

        let session = session();
        session.set_csrf_state("abc").unwrap();

        let mut p = params("site-abc");
        p.code = Some("code-1".to_string());
        let action = machine.evaluate(&session, &p, "/", "").await;

        assert_eq!(
            action,
            CallbackAction::Respond {
                payload: json!({"access_token": "tok", "token_type": "Bearer"}),
            }
        );
        assert!(session.csrf_state().is_none());
    }

    #[tokio::test]
    async fn test_exchange_reuses_the_authorize_time_redirect_uri() {
        let exchanger = Arc::new(CannedTokenExchanger::default());
        exchanger.set_response("code-1", json!({"access_token": "tok"}));
        let machine = machine(Arc::clone(&exchanger) as Arc<dyn TokenExchanger>);

        let session = session();
        session.set_csrf_state("abc").unwrap();
        session
            .set_login_redirect_uri("https://www.example.com/login?SSO=1")
            .unwrap();

        let mut p = params("site-abc");
        p.code = Some("code-1".to_string());
        machine.evaluate(&session, &p, "/login", "").await;

        assert_eq!(
            exchanger.last_redirect_uri().as_deref(),
            Some("https://www.example.com/login?SSO=1")
        );
        // the redirect URI is cleared together with the state
        assert!(session.login_redirect_uri().is_none());
    }

    #[tokio::test]
    async fn test_exchange_without_stored_uri_falls_back_to_the_request_path() {
        let exchanger = Arc::new(CannedTokenExchanger::default());
        exchanger.set_response("code-1", json!({"access_token": "tok"}));
        let machine = machine(Arc::clone(&exchanger) as Arc<dyn TokenExchanger>);

        let session = session();
        session.set_csrf_state("abc").unwrap();

        let mut p = params("site-abc");
        p.code = Some("code-1".to_string());
        machine.evaluate(&session, &p, "/login", "").await;

        assert_eq!(
            exchanger.last_redirect_uri().as_deref(),
            Some("https://www.example.com/login")
        );
    }

    #[tokio::test]
    async fn test_replayed_callback_does_not_exchange_again() {
        let exchanger = Arc::new(CannedTokenExchanger::default());
        exchanger.set_response("code-1", json!({"access_token": "tok"}));
        let machine = machine(exchanger);

        let session = session();
        session.set_csrf_state("abc").unwrap();

        let mut p = params("site-abc");
        p.code = Some("code-1".to_string());

        let first = machine.evaluate(&session, &p, "/", "").await;
        assert!(matches!(first, CallbackAction::Respond { .. }));

        // the stored state is gone, so the replay is not a callback
        let second = machine.evaluate(&session, &p, "/", "").await;
        assert_eq!(second, CallbackAction::PassThrough);
    }

    #[tokio::test]
    async fn test_provider_error_is_forwarded_without_exchange() {
        let machine = machine(Arc::new(CannedTokenExchanger::default()));
        let session = session();
        session.set_csrf_state("abc").unwrap();

        let mut p = params("site-abc");
        p.error = Some("access_denied".to_string());
        p.error_description = Some("User denied access".to_string());

        let action = machine.evaluate(&session, &p, "/", "").await;
        assert_eq!(
            action,
            CallbackAction::Respond {
                payload: json!({
                    "error": "access_denied",
                    "error_description": "User denied access",
                }),
            }
        );
    }

    #[tokio::test]
    async fn test_exchange_failure_still_reaches_opener_as_error_payload() {
        struct FailingExchanger;

        #[async_trait]
        impl TokenExchanger for FailingExchanger {
            async fn exchange_code(&self, _: &str, _: &str) -> Result<Value, OAuthError> {
                Err(OAuthError::Exchange {
                    message: "invalid_grant".to_string(),
                    body: Some("{\"error\":\"invalid_grant\"}".to_string()),
                })
            }
        }

        let machine = machine(Arc::new(FailingExchanger));
        let session = session();
        session.set_csrf_state("abc").unwrap();

        let mut p = params("site-abc");
        p.code = Some("bad-code".to_string());

        match machine.evaluate(&session, &p, "/", "").await {
            CallbackAction::Respond { payload } => {
                assert_eq!(payload["error"], "token_exchange_failed");
            }
            other => panic!("expected error payload, got {other:?}"),
        }
    }
}
