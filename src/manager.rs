//! The engine facade used by presentation layers.
//!
//! `AioManager` owns one `ManagedProgram` and one `ProcessSupervisor` per
//! program, the shared template cache and provisioner, and the credential
//! slot linking the node's config to the trading desk's.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::json;
use tokio::task::JoinHandle;

use crate::conf::template::TemplateCache;
use crate::engine::fetch::BinaryProvisioner;
use crate::engine::lifecycle::{ProcessSupervisor, StopOutcome};
use crate::engine::multiprocess::discover_pids;
use crate::error::{Error, Result};
use crate::program::{ManagedProgram, ProgramStatus};
use crate::reconcile::{
    clear_credentials, read_credentials, NodeReconciler, SharedCredentials, TradingDeskReconciler,
    WalletReconciler,
};
use crate::registry::{ProgramKind, Registry};
use crate::retry::RetryPolicy;
use crate::rpc::{HealthMonitor, RpcClient};
use crate::settings::Settings;

struct Slot {
    program: Arc<ManagedProgram>,
    supervisor: Arc<ProcessSupervisor>,
}

/// Supervises the node, the trading desk and the wallet.
pub struct AioManager {
    registry: Arc<Registry>,
    settings: Mutex<Settings>,
    templates: TemplateCache,
    provisioner: Arc<BinaryProvisioner>,
    node: Slot,
    trading_desk: Slot,
    wallet: Slot,
    credentials: SharedCredentials,
    running: Arc<AtomicBool>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl AioManager {
    /// Build the engine from a registry, loading persisted settings and
    /// detecting what is already installed or running.
    pub fn new(registry: Registry) -> Self {
        Self::with_retry(registry, RetryPolicy::default())
    }

    /// Like [`AioManager::new`] with a custom network retry policy.
    pub fn with_retry(registry: Registry, retry: RetryPolicy) -> Self {
        let registry = Arc::new(registry);
        let settings = Settings::load(&registry.settings_file());
        let provisioner = Arc::new(BinaryProvisioner::new(&registry).with_retry(retry));
        let templates = TemplateCache::new(&registry).with_retry(retry);

        let slot = |kind: ProgramKind| {
            let spec = registry.program(kind).clone();
            let data_dir = settings
                .data_path(kind)
                .map(Path::to_path_buf)
                .unwrap_or_else(|| spec.data_dir.clone());
            let program = Arc::new(ManagedProgram::new(kind, data_dir));
            let supervisor = Arc::new(ProcessSupervisor::new(
                &registry,
                spec,
                Arc::clone(&program),
                Arc::clone(&provisioner),
            ));
            supervisor.refresh_installed();
            supervisor.recover();
            Slot {
                program,
                supervisor,
            }
        };

        let node = slot(ProgramKind::Node);
        let trading_desk = slot(ProgramKind::TradingDesk);
        let wallet = slot(ProgramKind::Wallet);

        log::info!("Engine home {:?} on {}", registry.home, registry.platform);

        Self {
            settings: Mutex::new(settings),
            templates,
            provisioner,
            node,
            trading_desk,
            wallet,
            credentials: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            monitors: Mutex::new(Vec::new()),
            registry,
        }
    }

    fn slot(&self, kind: ProgramKind) -> &Slot {
        match kind {
            ProgramKind::Node => &self.node,
            ProgramKind::TradingDesk => &self.trading_desk,
            ProgramKind::Wallet => &self.wallet,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn program(&self, kind: ProgramKind) -> &Arc<ManagedProgram> {
        &self.slot(kind).program
    }

    pub fn supervisor(&self, kind: ProgramKind) -> &Arc<ProcessSupervisor> {
        &self.slot(kind).supervisor
    }

    /// Credentials published by the last node reconciliation.
    pub fn credentials(&self) -> &SharedCredentials {
        &self.credentials
    }

    /// Snapshot of one program. Never blocks on I/O.
    pub fn status(&self, kind: ProgramKind) -> ProgramStatus {
        self.program(kind).status()
    }

    /// Download and install the expected release.
    pub async fn install(&self, kind: ProgramKind) -> Result<PathBuf> {
        let slot = self.slot(kind);
        let _busy = slot.program.try_begin().ok_or(Error::Busy(kind))?;

        slot.program.set_downloading(true);
        let result = self
            .provisioner
            .install(slot.supervisor.spec(), slot.program.as_ref())
            .await;
        slot.program.set_downloading(false);

        let executable = result?;
        slot.supervisor.refresh_installed();
        log::info!("{} installed at {:?}", kind, executable);
        Ok(executable)
    }

    /// Remove every install of a stopped program.
    pub async fn delete(&self, kind: ProgramKind) -> Result<()> {
        let slot = self.slot(kind);
        let _busy = slot.program.try_begin().ok_or(Error::Busy(kind))?;
        if slot.program.is_running() {
            return Err(Error::Running(kind));
        }

        let provisioner = Arc::clone(&self.provisioner);
        let spec = slot.supervisor.spec().clone();
        tokio::task::spawn_blocking(move || provisioner.uninstall(&spec)).await??;

        slot.program.set_installed(None, None);
        log::info!("{} deleted", kind);
        Ok(())
    }

    /// Start a program, installing it first when needed. Returns its PID.
    pub async fn start(&self, kind: ProgramKind) -> Result<u32> {
        let slot = self.slot(kind);
        let _busy = slot.program.try_begin().ok_or(Error::Busy(kind))?;
        Ok(slot.supervisor.start().await?)
    }

    /// Stop a program, forcing it down after its stop timeout.
    pub async fn stop(&self, kind: ProgramKind) -> Result<StopOutcome> {
        let slot = self.slot(kind);
        let _busy = slot.program.try_begin().ok_or(Error::Busy(kind))?;

        let supervisor = Arc::clone(&slot.supervisor);
        Ok(tokio::task::spawn_blocking(move || supervisor.stop()).await??)
    }

    /// Point a program at a different data directory and persist the choice.
    pub fn set_custom_data_path(&self, kind: ProgramKind, path: &Path) -> Result<()> {
        let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        settings.custom_data_paths.insert(kind, path.to_path_buf());
        settings.save(&self.registry.settings_file())?;
        drop(settings);

        let program = self.program(kind);
        program.set_data_dir(path);
        program.set_config_in_sync(false);
        if kind == ProgramKind::Node {
            // Published credentials describe the old directory's blocknet.conf.
            clear_credentials(&self.credentials);
        }
        log::info!("{} data directory set to {:?}", kind, path);
        Ok(())
    }

    /// Bring a program's configuration in line with its templates.
    ///
    /// Returns `true` when a file was rewritten. Failures are logged and
    /// reported as `false`; `config_in_sync` records whether the pass completed.
    pub async fn reconcile(&self, kind: ProgramKind) -> bool {
        let result = match kind {
            ProgramKind::Node => self.reconcile_node().await,
            ProgramKind::TradingDesk => self.reconcile_trading_desk().await,
            ProgramKind::Wallet => WalletReconciler::new(&self.program(kind).data_dir())
                .reconcile(&self.templates)
                .await
                .map_err(Error::from),
        };
        self.record_reconcile(kind, result)
    }

    fn record_reconcile(&self, kind: ProgramKind, result: Result<bool>) -> bool {
        let program = self.program(kind);
        match result {
            Ok(changed) => {
                program.set_config_in_sync(true);
                changed
            }
            Err(e) => {
                log::error!("Failed to reconcile {} config: {}", kind, e);
                program.set_config_in_sync(false);
                false
            }
        }
    }

    async fn reconcile_node(&self) -> Result<bool> {
        let data_dir = self.program(ProgramKind::Node).data_dir();
        let reconciler =
            NodeReconciler::new(&self.registry, &data_dir, Arc::clone(&self.credentials));
        Ok(reconciler.reconcile(&self.templates).await?)
    }

    /// The node conf is reconciled first so `[BLOCK]` and `app-meta.json`
    /// always copy what `blocknet.conf` holds on disk right now.
    async fn reconcile_trading_desk(&self) -> Result<bool> {
        let result = self.reconcile_node().await;
        self.record_reconcile(ProgramKind::Node, result);

        let reconciler = TradingDeskReconciler::new(
            &self.registry,
            &self.program(ProgramKind::Node).data_dir(),
            &self.program(ProgramKind::TradingDesk).data_dir(),
            &self.program(ProgramKind::Wallet).data_dir(),
            Arc::clone(&self.credentials),
        );
        let changes = reconciler.reconcile(&self.templates).await?;

        if changes.xbridge {
            self.reload_xbridge_conf().await;
        }
        Ok(changes.any())
    }

    /// Ask a running node to re-read `xbridge.conf`.
    async fn reload_xbridge_conf(&self) {
        if !self.program(ProgramKind::Node).rpc_valid() {
            return;
        }
        let Some(credentials) = read_credentials(&self.credentials) else {
            return;
        };
        match RpcClient::new(&credentials)
            .call("dxloadxbridgeconf", json!([]))
            .await
        {
            Some(_) => log::info!("Node reloaded {}", crate::reconcile::trading_desk::XBRIDGE_CONF),
            None => log::warn!("Node did not accept dxloadxbridgeconf"),
        }
    }

    /// Feed an external process scan into one program's supervisor.
    pub fn update_discovered_pids(&self, kind: ProgramKind, pids: Vec<u32>) {
        self.supervisor(kind).update_discovered_pids(pids);
    }

    /// Scan the process table for every program.
    pub async fn scan_processes(&self) -> Result<()> {
        for kind in ProgramKind::ALL {
            let names = self.supervisor(kind).spec().process_names.clone();
            let pids = tokio::task::spawn_blocking(move || discover_pids(&names)).await?;
            self.update_discovered_pids(kind, pids);
        }
        Ok(())
    }

    /// Start the health monitors. Calling it again while they run is a no-op.
    pub fn start_background_work(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut monitors = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
        for kind in ProgramKind::ALL.into_iter().filter(ProgramKind::is_node_like) {
            let monitor = HealthMonitor::new(
                Arc::clone(self.program(kind)),
                Arc::clone(&self.credentials),
                Arc::clone(&self.running),
            );
            monitors.push(monitor.start_background_work());
        }
        log::info!("Started {} health monitor(s)", monitors.len());
    }

    /// Stop background work. Supervised programs keep running.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);

        let handles: Vec<_> = self
            .monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("Health monitor ended abnormally: {}", e);
            }
        }
        log::info!("Engine shut down");
    }
}
