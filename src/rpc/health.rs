//! Background RPC health probe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use crate::defaults;
use crate::program::ManagedProgram;
use crate::reconcile::Credentials;
use crate::rpc::RpcClient;

/// Polls `getnetworkinfo` on a node-like program and records `rpc_valid`.
pub struct HealthMonitor {
    program: Arc<ManagedProgram>,
    credentials: Arc<RwLock<Option<Credentials>>>,
    running: Arc<AtomicBool>,
    interval: Duration,
    url: Option<String>,
    /// Client built for the credentials it was last asked for.
    cached: Mutex<Option<(Credentials, RpcClient)>>,
}

impl HealthMonitor {
    pub fn new(
        program: Arc<ManagedProgram>,
        credentials: Arc<RwLock<Option<Credentials>>>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            program,
            credentials,
            running,
            interval: defaults::health_poll_interval(),
            url: None,
            cached: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Probe this URL instead of loopback at the credentials' port.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Client for the current credentials, rebuilt only when they change.
    fn client(&self) -> Option<RpcClient> {
        let creds = self
            .credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());

        let Some(creds) = creds else {
            *cached = None;
            return None;
        };
        if let Some((known, client)) = cached.as_ref() {
            if *known == creds {
                return Some(client.clone());
            }
        }

        let client = match &self.url {
            Some(url) => RpcClient::with_url(url.clone(), &creds.user, &creds.password),
            None => RpcClient::new(&creds),
        };
        *cached = Some((creds, client.clone()));
        Some(client)
    }

    /// One probe. Returns the new `rpc_valid` value.
    pub async fn probe(&self) -> bool {
        let valid = match self.client() {
            Some(client) if self.program.is_running() => client
                .call("getnetworkinfo", json!([]))
                .await
                .is_some(),
            _ => false,
        };

        if valid != self.program.rpc_valid() {
            log::info!(
                "{} RPC {}",
                self.program.kind(),
                if valid { "reachable" } else { "unreachable" }
            );
        }
        self.program.set_rpc_valid(valid);
        valid
    }

    /// Spawn the polling loop. It exits once the running flag is cleared.
    pub fn start_background_work(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::debug!("{} health monitor started", self.program.kind());
            while self.running.load(Ordering::SeqCst) {
                self.probe().await;
                tokio::time::sleep(self.interval).await;
            }
            self.program.set_rpc_valid(false);
            log::debug!("{} health monitor stopped", self.program.kind());
        })
    }
}
