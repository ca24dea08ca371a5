//! OAuth2 federation: provider client, wire types, callback handling

pub mod callback;
pub mod client;
pub mod http;
pub mod types;

pub use callback::{CallbackAction, CallbackParams, CallbackStateMachine};
pub use client::{OAuth2Client, ProfileFetcher, TokenExchanger};
pub use types::{
    AccessTokenPayload, ConfiguredClient, CsrfState, OAuthError, ProviderErrorPayload,
    ResourceOwnerProfile,
};
