//! Margin annotation-service bridge: idempotent user and group upserts,
//! group membership, and the grant tokens the annotation client logs in with.

pub mod client;
pub mod grant;
pub mod models;
pub mod provision;

pub use client::HClient;
pub use grant::GrantTokenIssuer;
pub use provision::Provisioner;
