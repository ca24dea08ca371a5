//! Error types and the structured JSON error envelope
//!
//! Every failure raised inside the auth action is caught at the top level
//! and converted into `{success: false, message, trace?, response?}`;
//! nothing propagates to a framework error page. Debug deployments
//! additionally receive a stack trace and, for provider-exchange
//! failures, the raw provider response body. Faults capture their
//! backtrace when they are constructed, not when the envelope is built,
//! so the trace points at the failure site.

use std::backtrace::Backtrace;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::session::SessionError;

/// Captured backtrace; the alias keeps thiserror's derive from emitting
/// the nightly-only `error_generic_member_access` provide support it
/// generates for fields whose type is spelled `Backtrace`
type Trace = Backtrace;

/// Engine error type
#[derive(Debug, Error)]
pub enum SsoError {
    /// Authorization-code exchange against the token endpoint failed
    #[error("Provider token exchange failed: {message}")]
    ProviderExchange {
        /// Human-readable failure summary
        message: String,
        /// Raw provider response body, if one was received
        body: Option<String>,
        /// Backtrace from the failure site
        trace: Trace,
    },

    /// Resource-owner profile fetch failed
    #[error("Provider profile fetch failed: {message}")]
    ProviderProfile {
        /// Human-readable failure summary
        message: String,
        /// Raw provider response body, if one was received
        body: Option<String>,
        /// Backtrace from the failure site
        trace: Trace,
    },

    /// Non-POST request on the auth action
    #[error("Permission denied")]
    MethodNotAllowed,

    /// First-time remote identity with no local account to log in
    #[error("{}", if *.registration_allowed {
        "Account not found; registration is allowed"
    } else {
        "Account not found"
    })]
    AccountNotFound {
        /// Whether the client may route to a registration form
        registration_allowed: bool,
    },

    /// Fatal inconsistency: the cross-reference points at a local
    /// account that no longer exists
    #[error("Linked local account is missing")]
    LinkedAccountMissing,

    /// Fatal inconsistency: linking was attempted before the
    /// cross-reference row was created
    #[error("Remote identity is unknown")]
    RemoteIdentityUnknown,

    /// The local account is already linked to a different remote
    /// identity; the existing link is never overwritten
    #[error("Account not linked")]
    AccountAlreadyLinkedElsewhere,

    /// The authentication-event pipeline vetoed the login
    #[error("Login rejected")]
    LoginRejected,

    /// Malformed client input
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Database error
    #[error("Database error: {source}")]
    Database {
        /// Underlying database failure
        #[source]
        source: sqlx::Error,
        /// Backtrace from the failure site
        trace: Trace,
    },

    /// Session error
    #[error("Session error: {source}")]
    Session {
        /// Underlying session failure
        #[source]
        source: SessionError,
        /// Backtrace from the failure site
        trace: Trace,
    },
}

impl From<sqlx::Error> for SsoError {
    fn from(source: sqlx::Error) -> Self {
        Self::Database {
            source,
            trace: Backtrace::force_capture(),
        }
    }
}

impl From<SessionError> for SsoError {
    fn from(source: SessionError) -> Self {
        Self::Session {
            source,
            trace: Backtrace::force_capture(),
        }
    }
}

impl SsoError {
    /// HTTP status for this error.
    ///
    /// Everything except the method gate is a 500-equivalent: the client
    /// widget routes on the message, not the status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Raw provider body, when this error carries one
    #[must_use]
    pub fn provider_body(&self) -> Option<&str> {
        match self {
            Self::ProviderExchange { body, .. } | Self::ProviderProfile { body, .. } => {
                body.as_deref()
            }
            _ => None,
        }
    }

    /// Backtrace recorded when the fault was constructed; policy
    /// outcomes (rejections, method gate, bad input) carry none
    #[must_use]
    pub fn trace(&self) -> Option<&Backtrace> {
        match self {
            Self::ProviderExchange { trace, .. }
            | Self::ProviderProfile { trace, .. }
            | Self::Database { trace, .. }
            | Self::Session { trace, .. } => Some(trace),
            _ => None,
        }
    }

    /// Convert into the structured JSON error response.
    ///
    /// `debug` gates the stack trace and the raw provider body; a
    /// production deployment only ever sees the message.
    #[must_use]
    pub fn into_envelope(self, debug: bool) -> Response {
        let mut envelope = json!({
            "success": false,
            "message": self.to_string(),
        });

        if debug {
            if let Some(trace) = self.trace() {
                let lines: Vec<String> =
                    trace.to_string().lines().map(str::to_owned).collect();
                envelope["trace"] = json!(lines);
            }

            if let Some(body) = self.provider_body() {
                envelope["response"] = json!(body);
            }
        }

        (self.status(), Json(envelope)).into_response()
    }
}

// Production-safe fallback used where no configuration is in scope;
// the auth action always goes through `into_envelope` instead.
impl IntoResponse for SsoError {
    fn into_response(self) -> Response {
        self.into_envelope(false)
    }
}
