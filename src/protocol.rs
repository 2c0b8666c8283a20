//! RouterOS protocol clients.
//!
//! - [`ApiClient`]: binary management API over TCP or TLS
//! - [`RestClient`]: HTTPS JSON variant (RouterOS 7+)
//!
//! Both implement [`RouterClient`], so tier loops never know which one they drive.

mod api;
pub mod codec;
mod factory;
#[cfg(test)]
pub(crate) mod mock;
mod rest;
mod tls;
mod traits;

pub use api::{ApiClient, ApiConnection, ApiStream};
pub use factory::{ClientFactory, DefaultClientFactory};
pub use rest::RestClient;
pub use traits::{ProtocolError, RouterClient, Row};
