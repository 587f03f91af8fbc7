//! `blocknet.conf` reconciliation.

use std::path::{Path, PathBuf};

use crate::conf::template::{TemplateCache, TemplateKind};
use crate::defaults;
use crate::reconcile::{
    apply_template, ensure_credentials, load_document, merge_seeds, pin_loopback,
    publish_credentials, raise_floors, write_if_changed, Credentials, Result, SharedCredentials,
};
use crate::registry::Registry;

pub const NODE_CONF: &str = "blocknet.conf";

/// Keeps the node's own config in line with its wallet template.
pub struct NodeReconciler {
    conf_path: PathBuf,
    template: TemplateKind,
    seeds: Vec<String>,
    credentials: SharedCredentials,
}

impl NodeReconciler {
    pub fn new(registry: &Registry, data_dir: &Path, credentials: SharedCredentials) -> Self {
        Self {
            conf_path: data_dir.join(NODE_CONF),
            template: TemplateKind::Wallet(registry.node_template_file.clone()),
            seeds: registry.node_seeds.clone(),
            credentials,
        }
    }

    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    /// Reconcile `blocknet.conf` and publish the resulting credentials.
    pub async fn reconcile(&self, templates: &TemplateCache) -> Result<bool> {
        let template = templates.get_template(&self.template).await?;

        let local = load_document(&self.conf_path);
        let mut candidate = local.clone();

        apply_template(&mut candidate, &template);
        let global = candidate.global_mut();
        ensure_credentials(global);
        pin_loopback(global);
        raise_floors(global);
        merge_seeds(global, &self.seeds);

        let changed = write_if_changed(
            &self.conf_path,
            &local.serialize(),
            &candidate.serialize(),
        )?;

        let global = candidate.global();
        let credentials = Credentials {
            user: global.get_str("rpcuser").unwrap_or_default().to_string(),
            password: global.get_str("rpcpassword").unwrap_or_default().to_string(),
            port: global
                .get_str("rpcport")
                .filter(|p| !p.is_empty())
                .unwrap_or(defaults::NODE_RPC_PORT)
                .to_string(),
        };
        publish_credentials(&self.credentials, credentials);

        Ok(changed)
    }
}
