//! Delivery of collected data to the ingestion backend.
//!
//! - [`LocalBackend`]: in-process, calls the [`IngestionSink`] directly
//! - [`RemoteBackend`]: HMAC-signed JSON over HTTP

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::DeviceConfig;
use crate::ingest::wire::{
    CapabilitiesRequest, DevicesRequest, DevicesResponse, EventsRequest, EventsResponse,
    InterfacesRequest, InterfacesResponse, LeasesRequest, LeasesResponse, MetricsRequest,
    MetricsResponse, SessionsRequest, SessionsResponse, StatusResponse,
};
use crate::ingest::{
    DeviceMetrics, Envelope, EventRecord, IngestError, IngestReport, IngestionSink,
};
use crate::storage::{RawRecord, StorageError};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered but refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Where collectors fetch device configuration and deliver results.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Devices assigned to this collector.
    async fn fetch_devices(&self) -> Result<Vec<DeviceConfig>, BackendError>;

    async fn push_metrics(&self, batch: Vec<DeviceMetrics>) -> Result<IngestReport, BackendError>;

    /// Returns the number of events stored.
    async fn push_events(&self, events: Vec<EventRecord>) -> Result<usize, BackendError>;

    async fn push_interfaces(
        &self,
        device_uid: &str,
        interfaces: Vec<RawRecord>,
    ) -> Result<usize, BackendError>;

    async fn push_leases(&self, device_uid: &str, leases: Vec<RawRecord>)
    -> Result<usize, BackendError>;

    async fn push_sessions(
        &self,
        device_uid: &str,
        session_type: &str,
        sessions: Vec<RawRecord>,
    ) -> Result<usize, BackendError>;

    async fn push_capabilities(
        &self,
        device_uid: &str,
        capabilities: serde_json::Map<String, Value>,
    ) -> Result<(), BackendError>;

    /// Record or clear the last error of a device.
    ///
    /// The wire contract has no endpoint for this, so remote backends only log.
    async fn report_error(&self, device_uid: &str, error: Option<&str>) -> Result<(), BackendError> {
        if let Some(error) = error {
            tracing::warn!(device = %device_uid, error, "Device error");
        }
        Ok(())
    }
}

/// In-process backend sharing the database with the ingestion API.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    sink: IngestionSink,
}

impl LocalBackend {
    pub fn new(sink: IngestionSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn fetch_devices(&self) -> Result<Vec<DeviceConfig>, BackendError> {
        Ok(self.sink.device_configs().await?)
    }

    async fn push_metrics(&self, batch: Vec<DeviceMetrics>) -> Result<IngestReport, BackendError> {
        Ok(self.sink.ingest_metrics(&batch).await?)
    }

    async fn push_events(&self, events: Vec<EventRecord>) -> Result<usize, BackendError> {
        Ok(self.sink.ingest_events(&events).await?)
    }

    async fn push_interfaces(
        &self,
        device_uid: &str,
        interfaces: Vec<RawRecord>,
    ) -> Result<usize, BackendError> {
        Ok(self.sink.sync_interfaces(device_uid, &interfaces).await?)
    }

    async fn push_leases(
        &self,
        device_uid: &str,
        leases: Vec<RawRecord>,
    ) -> Result<usize, BackendError> {
        Ok(self.sink.sync_leases(device_uid, &leases).await?.synced)
    }

    async fn push_sessions(
        &self,
        device_uid: &str,
        session_type: &str,
        sessions: Vec<RawRecord>,
    ) -> Result<usize, BackendError> {
        Ok(self
            .sink
            .sync_sessions(device_uid, session_type, &sessions)
            .await?
            .synced)
    }

    async fn push_capabilities(
        &self,
        device_uid: &str,
        capabilities: serde_json::Map<String, Value>,
    ) -> Result<(), BackendError> {
        Ok(self
            .sink
            .update_capabilities(device_uid, &capabilities)
            .await?)
    }

    async fn report_error(&self, device_uid: &str, error: Option<&str>) -> Result<(), BackendError> {
        Ok(self.sink.set_last_error(device_uid, error).await?)
    }
}

/// HTTP backend speaking the ingestion wire contract.
#[derive(Clone)]
pub struct RemoteBackend {
    client: reqwest::Client,
    base: Url,
    collector_id: String,
    secret: Option<String>,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("base", &self.base.as_str())
            .field("collector_id", &self.collector_id)
            .field("signed", &self.secret.is_some())
            .finish()
    }
}

/// Response bodies all carry `success` and an optional `error`.
trait Acknowledged {
    fn outcome(&self) -> (bool, Option<&str>);
}

macro_rules! acknowledged {
    ($($ty:ty),* $(,)?) => {
        $(impl Acknowledged for $ty {
            fn outcome(&self) -> (bool, Option<&str>) {
                (self.success, self.error.as_deref())
            }
        })*
    };
}

acknowledged!(
    MetricsResponse,
    EventsResponse,
    InterfacesResponse,
    LeasesResponse,
    SessionsResponse,
    DevicesResponse,
    StatusResponse,
);

impl RemoteBackend {
    pub fn new(
        url: &str,
        collector_id: impl Into<String>,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let base = Url::parse(url).map_err(|e| BackendError::Rejected(format!("invalid url: {e}")))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            collector_id: collector_id.into(),
            secret: secret.filter(|s| !s.is_empty()),
        })
    }

    fn envelope(&self) -> Result<Envelope, BackendError> {
        Envelope::signed(&self.collector_id, self.secret.as_deref())
            .map_err(|e| BackendError::Rejected(e.to_string()))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Rejected("backend url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post<B, R>(&self, segments: &[&str], body: &B) -> Result<R, BackendError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned + Acknowledged,
    {
        let url = self.endpoint(segments)?;
        let resp = self.client.post(url).json(body).send().await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BackendError::Rejected("Authentication failed".to_string()));
        }
        let body: R = resp.error_for_status()?.json().await?;
        let (success, error) = body.outcome();
        if !success {
            return Err(BackendError::Rejected(
                error.unwrap_or("request failed").to_string(),
            ));
        }
        Ok(body)
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn fetch_devices(&self) -> Result<Vec<DeviceConfig>, BackendError> {
        let req = DevicesRequest {
            envelope: self.envelope()?,
        };
        let resp: DevicesResponse = self.post(&["devices"], &req).await?;
        Ok(resp.devices)
    }

    async fn push_metrics(&self, batch: Vec<DeviceMetrics>) -> Result<IngestReport, BackendError> {
        let req = MetricsRequest {
            envelope: self.envelope()?,
            devices: batch,
        };
        let resp: MetricsResponse = self.post(&["ingest", "metrics"], &req).await?;
        Ok(IngestReport {
            metrics_processed: resp.metrics_processed,
            rates_suppressed: resp.rates_suppressed,
            errors: resp.errors.unwrap_or_default(),
        })
    }

    async fn push_events(&self, events: Vec<EventRecord>) -> Result<usize, BackendError> {
        let req = EventsRequest {
            envelope: self.envelope()?,
            events,
        };
        let resp: EventsResponse = self.post(&["ingest", "events"], &req).await?;
        Ok(resp.events_created)
    }

    async fn push_interfaces(
        &self,
        device_uid: &str,
        interfaces: Vec<RawRecord>,
    ) -> Result<usize, BackendError> {
        let req = InterfacesRequest {
            envelope: self.envelope()?,
            device_uid: device_uid.to_string(),
            interfaces,
        };
        let resp: InterfacesResponse = self.post(&["ingest", "interfaces"], &req).await?;
        Ok(resp.interfaces_synced)
    }

    async fn push_leases(
        &self,
        device_uid: &str,
        leases: Vec<RawRecord>,
    ) -> Result<usize, BackendError> {
        let req = LeasesRequest {
            envelope: self.envelope()?,
            device_uid: device_uid.to_string(),
            leases,
        };
        let resp: LeasesResponse = self.post(&["ingest", "leases"], &req).await?;
        Ok(resp.leases_synced)
    }

    async fn push_sessions(
        &self,
        device_uid: &str,
        session_type: &str,
        sessions: Vec<RawRecord>,
    ) -> Result<usize, BackendError> {
        let req = SessionsRequest {
            envelope: self.envelope()?,
            device_uid: device_uid.to_string(),
            session_type: session_type.to_string(),
            sessions,
        };
        let resp: SessionsResponse = self.post(&["ingest", "sessions"], &req).await?;
        Ok(resp.sessions_synced)
    }

    async fn push_capabilities(
        &self,
        device_uid: &str,
        capabilities: serde_json::Map<String, Value>,
    ) -> Result<(), BackendError> {
        let req = CapabilitiesRequest {
            envelope: self.envelope()?,
            capabilities,
        };
        let _: StatusResponse = self
            .post(&["device", device_uid, "capabilities"], &req)
            .await?;
        Ok(())
    }
}
