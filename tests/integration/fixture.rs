use std::path::PathBuf;

use aio_supervisor::{AioManager, DataDirs, Platform, Registry, RetryPolicy};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// An isolated engine home plus an HTTP double for every remote endpoint.
pub(crate) struct TestEnv {
    _dir: TempDir,
    pub(crate) server: MockServer,
    pub(crate) registry: Registry,
}

impl TestEnv {
    pub(crate) async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start().await;

        let dirs = DataDirs {
            node: dir.path().join("blocknet"),
            trading_desk: dir.path().join("blockdx"),
            wallet: dir.path().join("xlite"),
        };
        let mut registry = Registry::new(Platform::current(), dir.path().join("home"), dirs);
        registry.template_base_url = server.uri();
        registry.manifest_url = format!("{}/manifest-latest.json", server.uri());

        Self {
            _dir: dir,
            server,
            registry,
        }
    }

    pub(crate) fn manager(&self) -> AioManager {
        AioManager::with_retry(self.registry.clone(), RetryPolicy::once())
    }

    pub(crate) fn node_dir(&self) -> PathBuf {
        self.registry.node.data_dir.clone()
    }

    /// Serve `body` at `remote_path` (e.g. `wallet-confs/x.conf`).
    pub(crate) async fn serve(&self, remote_path: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/{}", remote_path)))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&self.server)
            .await;
    }

    pub(crate) async fn serve_node_templates(&self, wallet_conf: &str, xbridge_conf: &str) {
        let file = self.registry.node_template_file.clone();
        self.serve(&format!("wallet-confs/{}", file), wallet_conf).await;
        self.serve(&format!("xbridge-confs/{}", file), xbridge_conf).await;
    }
}

pub(crate) const NODE_WALLET_CONF: &str = "\
server=1
listen=1
rpcport=41414
rpcbind=0.0.0.0
rpcallowip=0.0.0.0/0
rpcthreads=8
rpcworkqueue=16
";

pub(crate) const NODE_XBRIDGE_CONF: &str = "\
[Main]
ExchangeWallets=
FullLog=true
ShowAllOrders=true

[BLOCK]
Title=Blocknet
Ip=127.0.0.1
Port=41414
Username=
Password=
AddressPrefix=26
";
