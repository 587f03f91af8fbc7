//! JSON-RPC access to node-like programs.
//!
//! - `RpcClient`: one-shot calls that collapse every failure to `None`
//! - `HealthMonitor`: periodic `getnetworkinfo` probe feeding `rpc_valid`

pub mod health;

pub use health::HealthMonitor;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::defaults;
use crate::reconcile::Credentials;

/// Minimal JSON-RPC 2.0 client with basic auth.
#[derive(Clone)]
pub struct RpcClient {
    client: Client,
    url: String,
    user: String,
    password: String,
}

impl RpcClient {
    /// Client for a program listening on loopback at the credentials' port.
    pub fn new(credentials: &Credentials) -> Self {
        Self::with_url(
            format!("http://{}:{}/", defaults::LOOPBACK, credentials.port),
            &credentials.user,
            &credentials.password,
        )
    }

    pub fn with_url(url: impl Into<String>, user: &str, password: &str) -> Self {
        let client = Client::builder()
            .timeout(defaults::rpc_timeout())
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            url: url.into(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method` and return its `result`.
    ///
    /// Any non-200 status, transport failure, undecodable body or missing
    /// `result` key yields `None`.
    pub async fn call(&self, method: &str, params: Value) -> Option<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });

        let response = match self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                log::debug!("RPC {} to {} failed: {}", method, self.url, e);
                return None;
            }
        };

        if response.status() != StatusCode::OK {
            log::debug!("RPC {} returned HTTP {}", method, response.status());
            return None;
        }

        match response.json::<Value>().await {
            Ok(Value::Object(mut map)) => map.remove("result"),
            Ok(_) => None,
            Err(e) => {
                log::debug!("RPC {} returned malformed JSON: {}", method, e);
                None
            }
        }
    }
}
