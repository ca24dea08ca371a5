//! Configuration for the SSO federation engine
//!
//! Configuration is loaded from multiple sources with clear precedence:
//!
//! 1. Environment variables (highest priority, `SSO_` prefix)
//! 2. `./sso.toml` (development)
//! 3. Hardcoded defaults (fallback)
//!
//! # Example Configuration
//!
//! ```toml
//! # sso.toml
//! [provider]
//! endpoint = "https://id.example.com"
//! client_id = "my-client"
//! client_secret = "shhh"
//!
//! [registration]
//! allow_registration = true
//! define_registration_fields = true
//!
//! [routing]
//! base_url = "https://www.example.com/"
//! multilingual = false
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// The deployment area a request belongs to.
///
/// The CSRF state token is prefixed with the issuing context, and a
/// callback presented under a different context is replayed there rather
/// than processed. The context is decided once at construction time and
/// never inferred mid-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentContext {
    /// Public front-end deployment
    Site,
    /// Administrative back-end deployment
    Administrator,
}

impl DeploymentContext {
    /// Context name as used in the state-token prefix
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Site => "site",
            Self::Administrator => "administrator",
        }
    }

    /// Whether this is the administrative context
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Administrator)
    }
}

impl std::fmt::Display for DeploymentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External authorization server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Provider base URL; authorize/token/profile endpoints are derived
    /// from it by fixed path suffixes
    pub endpoint: String,
    /// OAuth2 client ID
    pub client_id: String,
    /// OAuth2 client secret
    pub client_secret: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
        }
    }
}

/// Self-registration policy for first-time remote identities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationSettings {
    /// Whether a first-time remote identity may register a local account
    /// on the front-end context
    pub allow_registration: bool,

    /// Whether the registration form is pre-filled from the cached
    /// remote profile
    pub define_registration_fields: bool,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            allow_registration: true,
            define_registration_fields: false,
        }
    }
}

/// Post-login redirect resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// Deployment root URL; absolute return targets must live under it
    /// to be considered internal
    pub base_url: String,

    /// Whether multi-language routing is active; when set, numeric
    /// return targets are annotated with the content language code
    pub multilingual: bool,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost/".to_string(),
            multilingual: false,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SsoConfig {
    /// Authorization server settings
    #[serde(default)]
    pub provider: ProviderSettings,

    /// Self-registration policy
    #[serde(default)]
    pub registration: RegistrationSettings,

    /// Redirect resolution settings
    #[serde(default)]
    pub routing: RoutingSettings,

    /// Debug deployments additionally expose stack traces and raw
    /// provider bodies in error responses
    #[serde(default)]
    pub debug: bool,
}

impl SsoConfig {
    /// Load configuration with the standard precedence:
    /// defaults, then `sso.toml`, then `SSO_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if a source is present but malformed.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("sso.toml"))
            .merge(Env::prefixed("SSO_").split("__"))
            .extract()
    }

    /// Load configuration from a specific TOML file, still honoring
    /// `SSO_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns error if the file or environment values are malformed.
    pub fn load_from(path: &str) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SSO_").split("__"))
            .extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SsoConfig::default();
        assert!(config.registration.allow_registration);
        assert!(!config.registration.define_registration_fields);
        assert!(!config.routing.multilingual);
        assert!(!config.debug);
    }

    #[test]
    fn test_context_as_str() {
        assert_eq!(DeploymentContext::Site.as_str(), "site");
        assert_eq!(DeploymentContext::Administrator.as_str(), "administrator");
        assert!(DeploymentContext::Administrator.is_admin());
        assert!(!DeploymentContext::Site.is_admin());
    }

    #[test]
    fn test_toml_round_trip() {
        let toml = r#"
            debug = true

            [provider]
            endpoint = "https://id.example.com"
            client_id = "abc"
            client_secret = "def"

            [routing]
            multilingual = true
        "#;
        let config: SsoConfig = toml::from_str(toml).unwrap();
        assert!(config.debug);
        assert_eq!(config.provider.endpoint, "https://id.example.com");
        assert!(config.routing.multilingual);
        // untouched section keeps defaults
        assert!(config.registration.allow_registration);
    }
}
