//! Scripted in-memory router for collector and scheduler tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::DeviceConfig;
use crate::protocol::{ClientFactory, ProtocolError, RouterClient, Row};

#[derive(Debug, Clone)]
enum Scripted {
    Rows(Vec<Row>),
    Trap(String),
    Transport,
    Panic,
}

#[derive(Debug, Default)]
struct State {
    responses: HashMap<String, Scripted>,
    delays: HashMap<String, Duration>,
    fail_connect: bool,
    connects: usize,
    disconnects: usize,
    calls: Vec<(String, Vec<(String, String)>)>,
}

/// Shared script and call log for one device.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockRouter {
    state: Arc<Mutex<State>>,
}

pub(crate) fn row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

impl MockRouter {
    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub(crate) fn respond(&self, path: &str, rows: Vec<Row>) {
        self.with(|s| s.responses.insert(path.to_string(), Scripted::Rows(rows)));
    }

    pub(crate) fn trap(&self, path: &str, message: &str) {
        self.with(|s| {
            s.responses
                .insert(path.to_string(), Scripted::Trap(message.to_string()))
        });
    }

    /// The next calls to `path` fail with a transport error.
    pub(crate) fn break_on(&self, path: &str) {
        self.with(|s| s.responses.insert(path.to_string(), Scripted::Transport));
    }

    /// Calls to `path` panic inside the calling task.
    pub(crate) fn panic_on(&self, path: &str) {
        self.with(|s| s.responses.insert(path.to_string(), Scripted::Panic));
    }

    pub(crate) fn delay(&self, path: &str, delay: Duration) {
        self.with(|s| s.delays.insert(path.to_string(), delay));
    }

    pub(crate) fn fail_connect(&self, fail: bool) {
        self.with(|s| s.fail_connect = fail);
    }

    pub(crate) fn connects(&self) -> usize {
        self.with(|s| s.connects)
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.with(|s| s.disconnects)
    }

    pub(crate) fn calls(&self, path: &str) -> usize {
        self.with(|s| s.calls.iter().filter(|(p, _)| p == path).count())
    }

    pub(crate) fn last_params(&self, path: &str) -> Option<Vec<(String, String)>> {
        self.with(|s| {
            s.calls
                .iter()
                .rev()
                .find(|(p, _)| p == path)
                .map(|(_, params)| params.clone())
        })
    }

    pub(crate) fn client(&self) -> MockClient {
        MockClient {
            router: self.clone(),
            connected: false,
        }
    }
}

pub(crate) struct MockClient {
    router: MockRouter,
    connected: bool,
}

#[async_trait::async_trait]
impl RouterClient for MockClient {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        let fail = self.router.with(|s| {
            s.connects += 1;
            s.fail_connect
        });
        if fail {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.router.with(|s| s.disconnects += 1);
        }
        self.connected = false;
    }

    async fn run_command(
        &mut self,
        path: &str,
        params: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Vec<Row>, ProtocolError> {
        if !self.connected {
            return Err(ProtocolError::NotConnected);
        }
        let (scripted, delay) = self.router.with(|s| {
            s.calls.push((
                path.to_string(),
                params
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ));
            (s.responses.get(path).cloned(), s.delays.get(path).copied())
        });

        if let Some(delay) = delay
            && tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .is_err()
        {
            self.connected = false;
            return Err(ProtocolError::Timeout(timeout));
        }

        match scripted {
            None => Ok(Vec::new()),
            Some(Scripted::Rows(rows)) => Ok(rows),
            Some(Scripted::Trap(message)) => Err(ProtocolError::Trap {
                category: None,
                message,
            }),
            Some(Scripted::Transport) => {
                self.connected = false;
                Err(ProtocolError::Fatal("connection reset".to_string()))
            }
            Some(Scripted::Panic) => panic!("scripted panic on {path}"),
        }
    }

    fn supports_rest(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Hands out clients bound to one [`MockRouter`] per device UID.
#[derive(Debug, Default)]
pub(crate) struct MockFactory {
    routers: Mutex<HashMap<String, MockRouter>>,
    created: AtomicUsize,
}

impl MockFactory {
    pub(crate) fn router(&self, device_uid: &str) -> MockRouter {
        self.routers
            .lock()
            .unwrap()
            .entry(device_uid.to_string())
            .or_default()
            .clone()
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ClientFactory for MockFactory {
    fn create(&self, device: &DeviceConfig) -> Result<Box<dyn RouterClient>, ProtocolError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.router(&device.device_uid).client()))
    }
}
