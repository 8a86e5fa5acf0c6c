//! CNI network configuration lists and runtime records.

use std::fmt;
use std::path::PathBuf;

use ipnet::Ipv4Net;
use meshbed_common::MeshbedError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{NetworkError, NetworkResult};

/// How the data-network address is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    /// Allocate from a subnet pool (`net`).
    Subnet(Ipv4Net),
    /// Assign exactly this address (`ip`).
    Address(Ipv4Net),
}

impl ConfigKind {
    /// Parse a kind tag and its value.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::UnsupportedConfigKind`] for tags other than
    /// `net` and `ip`, and a config error if the value is not a CIDR.
    pub fn parse(kind: &str, value: &str) -> NetworkResult<Self> {
        let parse_net = || {
            value.parse::<Ipv4Net>().map_err(|e| {
                NetworkError::Common(MeshbedError::Config {
                    message: format!("invalid {kind} value '{value}': {e}"),
                })
            })
        };

        match kind {
            "net" => parse_net().map(Self::Subnet),
            "ip" => parse_net().map(Self::Address),
            other => Err(NetworkError::UnsupportedConfigKind {
                kind: other.to_string(),
            }),
        }
    }

    /// The kind tag.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Subnet(_) => "net",
            Self::Address(_) => "ip",
        }
    }

    fn ipam(&self) -> Ipam {
        match *self {
            Self::Subnet(subnet) => Ipam::Pool { subnet },
            Self::Address(address) => Ipam::Fixed {
                ips: vec![IpamAddress {
                    version: "4".to_string(),
                    address,
                }],
            },
        }
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subnet(net) | Self::Address(net) => write!(f, "{}={}", self.as_str(), net),
        }
    }
}

/// Settings for the plugin that backs the data network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// CNI spec version written into the config list.
    pub cni_version: String,
    /// Network name written into the config list.
    pub network_name: String,
    /// Plugin binary (`type`).
    pub plugin_type: String,
    /// Whether to enable hairpin mode on the plugin.
    pub hairpin_mode: bool,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            cni_version: "0.3.0".to_string(),
            network_name: "weave-net".to_string(),
            plugin_type: "weave-net".to_string(),
            hairpin_mode: true,
        }
    }
}

/// IPAM section of a plugin config.
///
/// `Pool` and `Fixed` only match the exact shapes meshbed writes; any block
/// with other keys (e.g. a `host-local` config with `type` and `routes`) is
/// kept whole as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged, deny_unknown_fields)]
pub enum Ipam {
    /// Subnet pool.
    Pool {
        /// Pool to allocate from.
        subnet: Ipv4Net,
    },
    /// Fixed addresses.
    Fixed {
        /// Addresses to assign.
        ips: Vec<IpamAddress>,
    },
    /// Any other IPAM plugin configuration, passed through untouched.
    Other(Map<String, Value>),
}

/// One fixed IPAM address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamAddress {
    /// IP version, always "4".
    pub version: String,
    /// Address with prefix length.
    pub address: Ipv4Net,
}

/// One plugin entry of a config list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConf {
    /// Plugin name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Plugin binary.
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Address management.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<Ipam>,
    /// Hairpin mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hairpin_mode: Option<bool>,
    /// Plugin-specific keys, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A CNI network configuration list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfigList {
    /// CNI spec version.
    pub cni_version: String,
    /// Network name.
    pub name: String,
    /// Plugins, executed in order on ADD and in reverse on DEL.
    pub plugins: Vec<PluginConf>,
}

impl NetworkConfigList {
    /// Build the config list for the data network.
    #[must_use]
    pub fn build(kind: &ConfigKind, settings: &PluginSettings) -> Self {
        tracing::debug!(kind = %kind, plugin = %settings.plugin_type, "New network config list");

        Self {
            cni_version: settings.cni_version.clone(),
            name: settings.network_name.clone(),
            plugins: vec![PluginConf {
                name: Some(settings.network_name.clone()),
                plugin_type: settings.plugin_type.clone(),
                ipam: Some(kind.ipam()),
                hairpin_mode: Some(settings.hairpin_mode),
                extra: Map::new(),
            }],
        }
    }

    /// Parse a config list, rejecting lists without plugins.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed JSON or a config error for
    /// an empty plugin list.
    pub fn from_bytes(bytes: &[u8]) -> NetworkResult<Self> {
        let list: Self = serde_json::from_slice(bytes)?;
        if list.plugins.is_empty() {
            return Err(NetworkError::Common(MeshbedError::Config {
                message: format!("CNI config list '{}' has no plugins", list.name),
            }));
        }
        Ok(list)
    }

    /// The stdin document for one plugin invocation.
    ///
    /// The plugin object is extended with the list's `name` and
    /// `cniVersion`, the previous plugin's result, and any capability args
    /// the plugin declares in its `capabilities` map.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no plugin at `index`.
    pub fn plugin_stdin(
        &self,
        index: usize,
        prev_result: Option<&Value>,
        rt: &RuntimeConf,
    ) -> NetworkResult<Value> {
        let plugin = self.plugins.get(index).ok_or_else(|| {
            NetworkError::backend(format!("no plugin at index {index} in '{}'", self.name))
        })?;

        let mut doc = match serde_json::to_value(plugin)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        doc.insert("name".to_string(), Value::String(self.name.clone()));
        doc.insert(
            "cniVersion".to_string(),
            Value::String(self.cni_version.clone()),
        );
        if let Some(prev) = prev_result {
            doc.insert("prevResult".to_string(), prev.clone());
        }

        let runtime_config: Map<String, Value> = plugin
            .extra
            .get("capabilities")
            .and_then(Value::as_object)
            .map(|caps| {
                caps.iter()
                    .filter(|(_, enabled)| enabled.as_bool() == Some(true))
                    .filter_map(|(cap, _)| {
                        rt.capability_args
                            .get(cap)
                            .map(|arg| (cap.clone(), arg.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !runtime_config.is_empty() {
            doc.insert("runtimeConfig".to_string(), Value::Object(runtime_config));
        }

        Ok(Value::Object(doc))
    }
}

/// The runtime record a plugin is invoked with.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConf {
    /// Container ID.
    pub container_id: String,
    /// Path of the container's network namespace.
    pub netns: PathBuf,
    /// Interface name to create inside the namespace.
    pub if_name: String,
    /// Extra `CNI_ARGS` pairs.
    pub args: Vec<(String, String)>,
    /// Capability arguments, delivered to plugins that declare them.
    pub capability_args: Map<String, Value>,
}

impl RuntimeConf {
    /// Create a runtime record without extra args.
    #[must_use]
    pub fn new(
        container_id: impl Into<String>,
        netns: impl Into<PathBuf>,
        if_name: impl Into<String>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            netns: netns.into(),
            if_name: if_name.into(),
            args: Vec::new(),
            capability_args: Map::new(),
        }
    }

    /// The `CNI_ARGS` value: `K=V` pairs joined with `;`.
    #[must_use]
    pub fn cni_args(&self) -> String {
        self.args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}
