//! OAuth2 client for the single configured provider
//!
//! Wraps authorization-URL construction, state generation, the
//! authorization-code grant, and the resource-owner profile fetch.
//! Exactly one provider exists per deployment; its authorize, token, and
//! profile endpoints are all derived from the one configured base URL.

use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RequestTokenError,
    TokenUrl,
};
use serde_json::Value;

use crate::config::{DeploymentContext, ProviderSettings};
use crate::oauth2::http::send_token_request;
use crate::oauth2::types::{ConfiguredClient, CsrfState, OAuthError, ResourceOwnerProfile};

/// Fixed endpoint path suffixes appended to the provider base URL
const ENDPOINT_PATH: &str = "/index.php?api=oauth2&option=";

/// Authorization-code-for-token exchange seam
///
/// Implemented by [`OAuth2Client`]; test doubles substitute canned
/// token payloads so the callback machinery runs without a network.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    /// Exchange an authorization code for the provider token response.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Exchange`] carrying the raw provider body
    /// on non-success status or malformed response.
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Value, OAuthError>;
}

/// Resource-owner profile fetch seam
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    /// Fetch the resource-owner profile with a bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Profile`] on non-success status or a
    /// profile without a usable subject id.
    async fn fetch_resource_owner_profile(
        &self,
        access_token: &str,
    ) -> Result<ResourceOwnerProfile, OAuthError>;
}

/// Client for the single configured external authorization server
pub struct OAuth2Client {
    settings: ProviderSettings,
    context: DeploymentContext,
    /// Pooled HTTP client shared by token exchange and profile fetch;
    /// redirects disabled
    http_client: reqwest::Client,
}

impl OAuth2Client {
    /// Create a client for the configured provider in the given
    /// deployment context
    #[must_use]
    pub fn new(settings: ProviderSettings, context: DeploymentContext) -> Self {
        Self {
            settings,
            context,
            http_client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap_or_default(),
        }
    }

    /// Derived endpoint base: `{endpoint}/index.php?api=oauth2&option=`
    fn endpoint_base(&self) -> String {
        format!(
            "{}{ENDPOINT_PATH}",
            self.settings.endpoint.trim_end_matches(['/', ' '])
        )
    }

    /// Authorization endpoint URL
    #[must_use]
    pub fn authorize_url(&self) -> String {
        format!("{}authorize", self.endpoint_base())
    }

    /// Token endpoint URL
    #[must_use]
    pub fn token_url(&self) -> String {
        format!("{}token", self.endpoint_base())
    }

    /// Profile endpoint URL
    #[must_use]
    pub fn profile_url(&self) -> String {
        format!("{}profile", self.endpoint_base())
    }

    /// Build the typed `oauth2` client for one request.
    ///
    /// The redirect URI is the request URL at the time of the initial
    /// click, so a different deployment path scopes its own callbacks.
    fn configured_client(&self, redirect_uri: &str) -> Result<ConfiguredClient, OAuthError> {
        let client = BasicClient::new(ClientId::new(self.settings.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.settings.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new(self.authorize_url())
                    .map_err(|e| OAuthError::InvalidEndpoint(format!("auth URL: {e}")))?,
            )
            .set_token_uri(
                TokenUrl::new(self.token_url())
                    .map_err(|e| OAuthError::InvalidEndpoint(format!("token URL: {e}")))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(redirect_uri.to_string())
                    .map_err(|e| OAuthError::InvalidEndpoint(format!("redirect URI: {e}")))?,
            );
        Ok(client)
    }

    /// Build the provider authorization request.
    ///
    /// Returns the authorize URL (carrying the context-prefixed state)
    /// and the fresh [`CsrfState`]; the caller persists the raw token in
    /// the session.
    ///
    /// # Errors
    ///
    /// Returns error if the configured endpoint or redirect URI is not a
    /// valid URL.
    pub fn build_authorization_request(
        &self,
        redirect_uri: &str,
    ) -> Result<(String, CsrfState), OAuthError> {
        let state = CsrfState::generate(self.context);
        let client = self.configured_client(redirect_uri)?;

        let prefixed = state.prefixed();
        let (url, _csrf) = client.authorize_url(move || CsrfToken::new(prefixed)).url();

        Ok((url.to_string(), state))
    }
}

#[async_trait]
impl TokenExchanger for OAuth2Client {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Value, OAuthError> {
        let client = self.configured_client(redirect_uri)?;

        // A cloned handle (reqwest::Client is a cheap Arc clone) moved
        // into the closure keeps the bridge future free of borrows from
        // `self`; borrowing `self.http_client` inline trips rustc's
        // "implementation of `Send` is not general enough" check
        let http_client = self.http_client.clone();
        let send = move |req: oauth2::HttpRequest| {
            let http_client = http_client.clone();
            async move { send_token_request(&http_client, req).await }
        };
        let token_response = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&send)
            .await
            .map_err(|err| match err {
                RequestTokenError::ServerResponse(resp) => OAuthError::Exchange {
                    message: resp.to_string(),
                    body: serde_json::to_string(&resp).ok(),
                },
                RequestTokenError::Parse(parse_err, bytes) => OAuthError::Exchange {
                    message: parse_err.to_string(),
                    body: Some(String::from_utf8_lossy(&bytes).into_owned()),
                },
                other => OAuthError::Exchange {
                    message: other.to_string(),
                    body: None,
                },
            })?;

        serde_json::to_value(&token_response).map_err(|e| OAuthError::Exchange {
            message: format!("token response not serializable: {e}"),
            body: None,
        })
    }
}

#[async_trait]
impl ProfileFetcher for OAuth2Client {
    async fn fetch_resource_owner_profile(
        &self,
        access_token: &str,
    ) -> Result<ResourceOwnerProfile, OAuthError> {
        let response = self
            .http_client
            .get(self.profile_url())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| OAuthError::Profile {
                message: e.to_string(),
                body: None,
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(OAuthError::Profile {
                message: format!("HTTP {status}"),
                body: Some(body),
            });
        }

        let json: Value = serde_json::from_str(&body).map_err(|e| OAuthError::Profile {
            message: format!("malformed profile response: {e}"),
            body: Some(body.clone()),
        })?;

        ResourceOwnerProfile::from_provider_response(&json)
    }
}
