//! Config reconciliation through the manager, against served templates.

use aio_supervisor::{ConfigDocument, ProgramKind};
use serde_json::json;

use crate::fixture::{TestEnv, NODE_WALLET_CONF, NODE_XBRIDGE_CONF};

#[tokio::test]
async fn test_node_credentials_propagate_to_trading_desk() {
    let env = TestEnv::new().await;
    env.serve_node_templates(NODE_WALLET_CONF, NODE_XBRIDGE_CONF).await;
    let manager = env.manager();

    assert!(manager.reconcile(ProgramKind::Node).await);
    assert!(manager.reconcile(ProgramKind::TradingDesk).await);
    assert!(manager.status(ProgramKind::Node).config_in_sync);
    assert!(manager.status(ProgramKind::TradingDesk).config_in_sync);

    let node = ConfigDocument::load(&env.node_dir().join("blocknet.conf")).unwrap();
    let user = node.get("global", "rpcuser").unwrap().to_string();
    let password = node.get("global", "rpcpassword").unwrap().to_string();
    assert_eq!(user.len(), 32);
    assert_eq!(node.get("global", "rpcport"), Some("41414"));
    assert_eq!(node.get("global", "rpcallowip"), Some("127.0.0.1"));
    assert_eq!(node.get("global", "rpcworkqueue"), Some("64"));

    let xbridge = ConfigDocument::load(&env.node_dir().join("xbridge.conf")).unwrap();
    assert_eq!(xbridge.get("BLOCK", "Username"), Some(user.as_str()));
    assert_eq!(xbridge.get("BLOCK", "Password"), Some(password.as_str()));
    assert_eq!(xbridge.get("BLOCK", "Port"), Some("41414"));
    assert_eq!(xbridge.get("Main", "ExchangeWallets"), Some("BLOCK"));

    let meta_path = env.registry.trading_desk.data_dir.join("app-meta.json");
    let meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(meta_path).unwrap()).unwrap();
    assert_eq!(meta["user"], json!(user));
    assert_eq!(meta["password"], json!(password));
    assert_eq!(meta["port"], json!("41414"));

    // Second pass changes nothing and keeps the credentials.
    assert!(!manager.reconcile(ProgramKind::Node).await);
    assert!(!manager.reconcile(ProgramKind::TradingDesk).await);
    let again = ConfigDocument::load(&env.node_dir().join("blocknet.conf")).unwrap();
    assert_eq!(again.get("global", "rpcuser"), Some(user.as_str()));
}

#[tokio::test]
async fn test_trading_desk_reconciles_node_first_when_needed() {
    let env = TestEnv::new().await;
    env.serve_node_templates(NODE_WALLET_CONF, NODE_XBRIDGE_CONF).await;
    let manager = env.manager();

    assert!(manager.reconcile(ProgramKind::TradingDesk).await);
    assert!(env.node_dir().join("blocknet.conf").exists());
    assert!(manager.status(ProgramKind::Node).config_in_sync);
}

#[tokio::test]
async fn test_moved_node_directory_feeds_its_own_credentials() {
    let env = TestEnv::new().await;
    env.serve_node_templates(NODE_WALLET_CONF, NODE_XBRIDGE_CONF).await;
    let manager = env.manager();
    assert!(manager.reconcile(ProgramKind::Node).await);

    let moved = tempfile::tempdir().unwrap();
    std::fs::write(
        moved.path().join("blocknet.conf"),
        "rpcuser=operator\nrpcpassword=hunter2\n",
    )
    .unwrap();
    manager
        .set_custom_data_path(ProgramKind::Node, moved.path())
        .unwrap();

    assert!(manager.reconcile(ProgramKind::TradingDesk).await);

    let node = ConfigDocument::load(&moved.path().join("blocknet.conf")).unwrap();
    assert_eq!(node.get("global", "rpcuser"), Some("operator"));
    assert_eq!(node.get("global", "rpcpassword"), Some("hunter2"));

    let xbridge = ConfigDocument::load(&moved.path().join("xbridge.conf")).unwrap();
    assert_eq!(xbridge.get("BLOCK", "Username"), Some("operator"));
    assert_eq!(xbridge.get("BLOCK", "Password"), Some("hunter2"));

    let meta_path = env.registry.trading_desk.data_dir.join("app-meta.json");
    let meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(meta_path).unwrap()).unwrap();
    assert_eq!(meta["user"], json!("operator"));
    assert_eq!(meta["password"], json!("hunter2"));
}

#[tokio::test]
async fn test_unavailable_template_writes_nothing() {
    let env = TestEnv::new().await;
    let manager = env.manager();

    assert!(!manager.reconcile(ProgramKind::Node).await);
    assert!(!manager.status(ProgramKind::Node).config_in_sync);
    assert!(!env.node_dir().join("blocknet.conf").exists());

    assert!(!manager.reconcile(ProgramKind::TradingDesk).await);
    assert!(!env.node_dir().join("xbridge.conf").exists());
}

#[tokio::test]
async fn test_templates_are_served_from_cache_afterwards() {
    let env = TestEnv::new().await;
    env.serve_node_templates(NODE_WALLET_CONF, NODE_XBRIDGE_CONF).await;
    assert!(env.manager().reconcile(ProgramKind::Node).await);

    env.server.reset().await;
    std::fs::remove_file(env.node_dir().join("blocknet.conf")).unwrap();

    assert!(env.manager().reconcile(ProgramKind::Node).await);
    assert!(env.node_dir().join("blocknet.conf").exists());
}

#[tokio::test]
async fn test_wallet_coin_lands_in_xbridge_conf() {
    let env = TestEnv::new().await;
    env.serve_node_templates(NODE_WALLET_CONF, NODE_XBRIDGE_CONF).await;
    env.serve(
        "manifest-latest.json",
        &json!([
            {"ticker": "LTC", "ver_id": "litecoin--v0.17.1", "xbridge_conf": "litecoin--v0.17.1.conf", "wallet_conf": "litecoin--v0.17.1.conf"},
            {"ticker": "LTC", "ver_id": "litecoin--v0.18.1", "xbridge_conf": "litecoin--v0.18.1.conf", "wallet_conf": "litecoin--v0.18.1.conf"}
        ])
        .to_string(),
    )
    .await;
    env.serve(
        "xbridge-confs/litecoin--v0.18.1.conf",
        "[LTC]\nTitle=Litecoin\nIp=127.0.0.1\nPort=9332\nCoin=100000000\n",
    )
    .await;
    env.serve("wallet-confs/litecoin--v0.18.1.conf", "rpcport=9332\nserver=1\n")
        .await;

    let settings = env.registry.wallet.data_dir.join("settings");
    std::fs::create_dir_all(&settings).unwrap();
    std::fs::write(settings.join("config-LTC.json"), "{}").unwrap();

    let manager = env.manager();
    assert!(manager.reconcile(ProgramKind::Wallet).await);
    let ltc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(settings.join("config-LTC.json")).unwrap())
            .unwrap();
    assert_eq!(ltc["rpcEnabled"], json!(true));
    assert_eq!(ltc["rpcPort"], json!(9332));

    assert!(manager.reconcile(ProgramKind::TradingDesk).await);
    let xbridge = ConfigDocument::load(&env.node_dir().join("xbridge.conf")).unwrap();
    assert_eq!(xbridge.get("LTC", "Title"), Some("Litecoin"));
    assert_eq!(xbridge.get("LTC", "Port"), Some("9332"));
    assert_eq!(xbridge.get("LTC", "Username"), ltc["rpcUsername"].as_str());
    assert_eq!(xbridge.get("Main", "ExchangeWallets"), Some("BLOCK,LTC"));
}
