//! Client construction per device.

use std::time::Duration;

use crate::config::DeviceConfig;
use crate::protocol::{ApiClient, ProtocolError, RestClient, RouterClient};

/// Builds the protocol client for a device.
///
/// The scheduler owns one factory and calls it whenever a collector is
/// (re)built, so tests can substitute scripted clients.
pub trait ClientFactory: Send + Sync + 'static {
    fn create(&self, device: &DeviceConfig) -> Result<Box<dyn RouterClient>, ProtocolError>;
}

/// Binary API or REST, following the device's `transport` setting.
#[derive(Debug, Clone)]
pub struct DefaultClientFactory {
    connect_timeout: Duration,
}

impl DefaultClientFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl ClientFactory for DefaultClientFactory {
    fn create(&self, device: &DeviceConfig) -> Result<Box<dyn RouterClient>, ProtocolError> {
        if device.use_rest() {
            Ok(Box::new(RestClient::new(device, self.connect_timeout)?))
        } else {
            Ok(Box::new(ApiClient::new(device, self.connect_timeout)))
        }
    }
}
