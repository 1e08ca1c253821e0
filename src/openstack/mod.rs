//! OpenStack identity service integration.

mod auth;
mod client;

pub use auth::{AuthOptions, AuthOptionsError, EndpointOptions};
pub use client::KeystoneBroker;

use crate::broker::BrokerError;

impl From<AuthOptionsError> for BrokerError {
    fn from(e: AuthOptionsError) -> Self {
        BrokerError::InvalidSecrets(e.to_string())
    }
}
