//! CNI plugin execution.

use std::net::IpAddr;
use std::process::Stdio;

use async_trait::async_trait;
use ipnet::IpNet;
use meshbed_common::MeshbedPaths;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use super::config::{NetworkConfigList, RuntimeConf};
use crate::error::{NetworkError, NetworkResult};

/// Something that can add and remove a namespace from a CNI network.
#[async_trait]
pub trait CniPlugin: Send + Sync {
    /// Run `ADD` for every plugin of the list.
    async fn add_network_list(
        &self,
        list: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> NetworkResult<CniResult>;

    /// Run `DEL` for every plugin of the list, in reverse order.
    async fn del_network_list(&self, list: &NetworkConfigList, rt: &RuntimeConf)
    -> NetworkResult<()>;
}

/// An interface reported by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CniInterface {
    /// Interface name.
    pub name: String,
    /// MAC address.
    #[serde(default)]
    pub mac: Option<String>,
    /// Namespace path, empty for host interfaces.
    #[serde(default)]
    pub sandbox: Option<String>,
}

/// An address reported by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CniIpConfig {
    /// Index into the result's interfaces.
    #[serde(default)]
    pub interface: Option<usize>,
    /// Address with prefix length.
    pub address: IpNet,
    /// Gateway.
    #[serde(default)]
    pub gateway: Option<IpAddr>,
}

/// The result of a successful `ADD`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    /// CNI spec version of the result.
    #[serde(default)]
    pub cni_version: String,
    /// Interfaces created or touched.
    #[serde(default)]
    pub interfaces: Vec<CniInterface>,
    /// Assigned addresses.
    #[serde(default)]
    pub ips: Vec<CniIpConfig>,
}

impl CniResult {
    /// Parse a plugin's stdout document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the document is not a CNI result.
    pub fn from_value(value: Value) -> NetworkResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Deserialize)]
struct PluginErrorBody {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

/// Executes plugin binaries from the CNI plugin directories.
#[derive(Debug, Clone, Default)]
pub struct ExecPlugin {
    paths: MeshbedPaths,
}

impl ExecPlugin {
    /// Create an executor that searches `paths.cni_bin_dirs`.
    #[must_use]
    pub fn new(paths: MeshbedPaths) -> Self {
        Self { paths }
    }

    async fn exec(
        &self,
        plugin_type: &str,
        command: &str,
        stdin: &Value,
        rt: &RuntimeConf,
    ) -> NetworkResult<Option<Value>> {
        let binary = self
            .paths
            .find_plugin(plugin_type)
            .ok_or_else(|| NetworkError::Plugin {
                plugin: plugin_type.to_string(),
                code: 0,
                message: format!("failed to find plugin in {}", self.paths.cni_path_env()),
            })?;

        tracing::debug!(plugin = plugin_type, command, container_id = %rt.container_id, "Executing CNI plugin");

        let mut child = tokio::process::Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &rt.container_id)
            .env("CNI_NETNS", &rt.netns)
            .env("CNI_IFNAME", &rt.if_name)
            .env("CNI_ARGS", rt.cni_args())
            .env("CNI_PATH", self.paths.cni_path_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(&serde_json::to_vec(stdin)?).await?;
        }

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let (code, message) = match serde_json::from_slice::<PluginErrorBody>(&output.stdout) {
                Ok(body) if body.details.is_empty() => (body.code, body.msg),
                Ok(body) => (body.code, format!("{}; {}", body.msg, body.details)),
                Err(_) => (
                    0,
                    format!(
                        "{}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                ),
            };
            return Err(NetworkError::Plugin {
                plugin: plugin_type.to_string(),
                code,
                message,
            });
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&output.stdout)?))
    }
}

#[async_trait]
impl CniPlugin for ExecPlugin {
    async fn add_network_list(
        &self,
        list: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> NetworkResult<CniResult> {
        let mut prev: Option<Value> = None;

        for (index, plugin) in list.plugins.iter().enumerate() {
            let stdin = list.plugin_stdin(index, prev.as_ref(), rt)?;
            if let Some(result) = self.exec(&plugin.plugin_type, "ADD", &stdin, rt).await? {
                prev = Some(result);
            }
        }

        let result = prev.ok_or_else(|| NetworkError::Plugin {
            plugin: list.name.clone(),
            code: 0,
            message: "plugin chain produced no result".to_string(),
        })?;
        CniResult::from_value(result)
    }

    async fn del_network_list(
        &self,
        list: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> NetworkResult<()> {
        for (index, plugin) in list.plugins.iter().enumerate().rev() {
            let stdin = list.plugin_stdin(index, None, rt)?;
            self.exec(&plugin.plugin_type, "DEL", &stdin, rt).await?;
        }
        Ok(())
    }
}
