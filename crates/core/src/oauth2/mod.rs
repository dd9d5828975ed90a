//! OAuth 2 support for vendor APIs: token endpoint calls and the per-user
//! token store.

pub mod http_service;
pub mod token_store;

pub use http_service::{ClientAuth, OAuthHttpService, TokenEndpoint};
pub use token_store::TokenStore;
