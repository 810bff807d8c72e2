//! HTTP-JSON client for one plugin.
//!
//! Every call is `POST {address}/api/v1/{method}` with a JSON body. A 404
//! means the plugin does not implement the method; it is remembered and later
//! calls to that method return `Ok(None)` without a request.

use dashmap::DashSet;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use super::errors::{PluginError, PluginResult};
use crate::logging::log_plugin_operation;
use crate::resilience::classifier::is_transient_reqwest;

#[derive(Debug)]
pub struct PluginClient {
    name: String,
    address: String,
    client: Client,
    unimplemented: DashSet<String>,
}

impl PluginClient {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> PluginResult<Self> {
        let name = name.into();
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| PluginError::Transport {
                plugin: name.clone(),
                method: "connect".to_string(),
                message: e.to_string(),
                transient: false,
            })?;
        Ok(Self {
            name,
            address: address.into().trim_end_matches('/').to_string(),
            client,
            unimplemented: DashSet::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether a 404 was seen for `method`
    pub fn is_unimplemented(&self, method: &str) -> bool {
        self.unimplemented.contains(method)
    }

    fn url(&self, method: &str) -> String {
        format!("{}/api/v1/{method}", self.address)
    }

    /// Invoke `method`. `Ok(None)` means the plugin does not implement it or
    /// replied with an empty body.
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> PluginResult<Option<Resp>>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        if self.is_unimplemented(method) {
            return Ok(None);
        }

        let response = self
            .client
            .post(self.url(method))
            .json(request)
            .send()
            .await
            .map_err(|e| PluginError::Transport {
                plugin: self.name.clone(),
                method: method.to_string(),
                transient: is_transient_reqwest(&e),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| PluginError::Transport {
            plugin: self.name.clone(),
            method: method.to_string(),
            transient: true,
            message: e.to_string(),
        })?;

        match status {
            StatusCode::OK => {
                log_plugin_operation(&self.name, method, "ok", None);
                if body.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                serde_json::from_slice::<Option<Resp>>(&body).map_err(|e| PluginError::Decode {
                    plugin: self.name.clone(),
                    method: method.to_string(),
                    message: e.to_string(),
                })
            }
            StatusCode::NOT_FOUND => {
                log_plugin_operation(&self.name, method, "unimplemented", None);
                self.unimplemented.insert(method.to_string());
                Ok(None)
            }
            StatusCode::SERVICE_UNAVAILABLE => Err(PluginError::Transient {
                plugin: self.name.clone(),
                method: method.to_string(),
                body: String::from_utf8_lossy(&body).to_string(),
            }),
            other => {
                let body = String::from_utf8_lossy(&body).to_string();
                log_plugin_operation(&self.name, method, "error", Some(&body));
                Err(PluginError::Rpc {
                    plugin: self.name.clone(),
                    method: method.to_string(),
                    status: other.as_u16(),
                    body,
                })
            }
        }
    }
}
