//! Core OAuth2 wire types
//!
//! Defines the CSRF state token, the access-token payload posted back by
//! the client, the resource-owner profile, and the provider error type.

use oauth2::basic::BasicClient;
use oauth2::{EndpointNotSet, EndpointSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DeploymentContext;

/// Type alias for a configured OAuth2 client with auth and token
/// endpoints set
///
/// The type parameters indicate which endpoints are configured:
/// - `EndpointSet` for `HasAuthUrl` - Authorization endpoint is configured
/// - `EndpointNotSet` for `HasDeviceAuthUrl` - Device auth not used
/// - `EndpointNotSet` for `HasIntrospectionUrl` - Token introspection not used
/// - `EndpointNotSet` for `HasRevocationUrl` - Token revocation not used
/// - `EndpointSet` for `HasTokenUrl` - Token exchange endpoint is configured
pub type ConfiguredClient = BasicClient<
    EndpointSet,    // HasAuthUrl
    EndpointNotSet, // HasDeviceAuthUrl
    EndpointNotSet, // HasIntrospectionUrl
    EndpointNotSet, // HasRevocationUrl
    EndpointSet,    // HasTokenUrl
>;

/// CSRF state token bound to one login attempt
///
/// The browser-facing form is `<context>-<raw>`: the raw token is stored
/// in the initiating session, the prefixed form travels through the
/// provider redirect so a callback landing in the wrong deployment
/// context can be replayed in the right one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrfState {
    /// Context the state was issued under
    pub context: DeploymentContext,
    /// Raw single-use random token
    pub raw: String,
}

impl CsrfState {
    /// Generate a fresh unguessable state for the given context
    #[must_use]
    pub fn generate(context: DeploymentContext) -> Self {
        use rand::Rng;

        // 32 bytes of randomness, hex-encoded
        let random_bytes: [u8; 32] = rand::thread_rng().gen();
        Self {
            context,
            raw: hex::encode(random_bytes),
        }
    }

    /// The browser-facing `<context>-<raw>` form
    #[must_use]
    pub fn prefixed(&self) -> String {
        format!("{}-{}", self.context, self.raw)
    }

    /// Split an incoming state parameter into `(context name, raw)`.
    ///
    /// Returns `None` when the parameter has no context prefix, which is
    /// treated as not-a-callback by the state machine.
    #[must_use]
    pub fn split(state: &str) -> Option<(&str, &str)> {
        state.split_once('-')
    }
}

/// Access-token payload posted by the client after the popup exchange
///
/// The structure is the provider's token response verbatim; only the
/// `access_token` member is interpreted server-side, the rest is carried
/// opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenPayload {
    /// Bearer token used for the resource-owner profile fetch
    pub access_token: String,
    /// Remaining provider token-response members, uninterpreted
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Resource-owner profile subset used by the engine
///
/// The provider wraps the subject under a `profile` member; `id` may
/// arrive as a string or a number and is normalized to a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOwnerProfile {
    /// Provider-assigned subject identifier
    pub id: String,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Email address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl ResourceOwnerProfile {
    /// Extract the profile subset from a raw provider response.
    ///
    /// # Errors
    ///
    /// Returns error if the `profile.id` member is absent or not
    /// representable as a string.
    pub fn from_provider_response(body: &Value) -> Result<Self, OAuthError> {
        let profile = body.get("profile").unwrap_or(body);

        let id = match profile.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(OAuthError::Profile {
                    message: "provider profile has no usable id".to_string(),
                    body: Some(body.to_string()),
                })
            }
        };

        let text = |key: &str| {
            profile
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };

        Ok(Self {
            id,
            name: text("name"),
            username: text("username"),
            email: text("email"),
        })
    }
}

/// Error payload forwarded to the opener window when the provider
/// redirects back with an error instead of a code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderErrorPayload {
    /// Provider error code (e.g. `access_denied`)
    pub error: Option<String>,
    /// Provider error description
    pub error_description: Option<String>,
}

/// OAuth2 protocol errors
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// Authorization URL construction failed
    #[error("Invalid provider endpoint: {0}")]
    InvalidEndpoint(String),

    /// Authorization-code exchange failed
    #[error("Token exchange failed: {message}")]
    Exchange {
        /// Human-readable failure summary
        message: String,
        /// Raw provider response body, if one was received
        body: Option<String>,
    },

    /// Resource-owner profile fetch failed
    #[error("Profile fetch failed: {message}")]
    Profile {
        /// Human-readable failure summary
        message: String,
        /// Raw provider response body, if one was received
        body: Option<String>,
    },
}

impl From<OAuthError> for crate::error::SsoError {
    fn from(err: OAuthError) -> Self {
        let trace = std::backtrace::Backtrace::force_capture();
        match err {
            OAuthError::Exchange { message, body } => Self::ProviderExchange {
                message,
                body,
                trace,
            },
            OAuthError::Profile { message, body } => Self::ProviderProfile {
                message,
                body,
                trace,
            },
            OAuthError::InvalidEndpoint(msg) => Self::BadRequest(msg),
        }
    }
}
