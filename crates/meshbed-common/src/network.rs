//! Network configuration data model.
//!
//! A [`NetworkConfig`] is the desired state of one managed network for one
//! container. Test instances publish it, the control channel delivers it to
//! the container's sidecar, and the sidecar converges the kernel towards it.

use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Deserializer, Serialize};

use crate::bandwidth::Bandwidth;
use crate::error::{MeshbedError, MeshbedResult};

/// What happens to packets that match a shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    /// Deliver packets (subject to shaping).
    #[default]
    Accept,
    /// Refuse packets with an ICMP unreachable.
    Reject,
    /// Silently discard packets.
    Drop,
}

/// Emulated link characteristics.
///
/// Percentages are in `0.0..=100.0`. Correlations describe how strongly each
/// random decision depends on the previous one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkShape {
    /// Added one-way delay.
    #[serde(with = "millis")]
    pub latency: Duration,
    /// Random variation of the delay.
    #[serde(with = "millis")]
    pub jitter: Duration,
    /// Rate limit; zero means unlimited.
    pub bandwidth: Bandwidth,
    /// Filter applied to matching traffic.
    pub filter: FilterAction,
    /// Packet loss percentage.
    pub loss: f32,
    /// Packet corruption percentage.
    pub corrupt: f32,
    /// Corruption correlation percentage.
    pub corrupt_corr: f32,
    /// Reordering percentage.
    pub reorder: f32,
    /// Reordering correlation percentage.
    pub reorder_corr: f32,
    /// Duplication percentage.
    pub duplicate: f32,
    /// Duplication correlation percentage.
    pub duplicate_corr: f32,
}

impl LinkShape {
    /// Set latency.
    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set jitter.
    #[must_use]
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set bandwidth.
    #[must_use]
    pub fn bandwidth(mut self, bandwidth: Bandwidth) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    /// Set loss percentage.
    #[must_use]
    pub fn loss(mut self, loss: f32) -> Self {
        self.loss = loss;
        self
    }

    /// Set corruption percentage.
    #[must_use]
    pub fn corrupt(mut self, corrupt: f32) -> Self {
        self.corrupt = corrupt;
        self
    }

    /// Set filter action.
    #[must_use]
    pub fn filter(mut self, filter: FilterAction) -> Self {
        self.filter = filter;
        self
    }

    /// Whether this shape changes nothing about the traffic.
    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        self == &Self::default()
    }

    /// Check that every percentage is within `0.0..=100.0`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshbedError::InvalidShape`] naming the first bad field.
    pub fn validate(&self) -> MeshbedResult<()> {
        let fields = [
            ("loss", self.loss),
            ("corrupt", self.corrupt),
            ("corrupt_corr", self.corrupt_corr),
            ("reorder", self.reorder),
            ("reorder_corr", self.reorder_corr),
            ("duplicate", self.duplicate),
            ("duplicate_corr", self.duplicate_corr),
        ];

        for (name, value) in fields {
            if !(0.0..=100.0).contains(&value) {
                return Err(MeshbedError::InvalidShape {
                    message: format!("{name} must be a percentage between 0 and 100, got {value}"),
                });
            }
        }

        Ok(())
    }
}

/// A shape that applies to traffic towards one subnet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRule {
    /// Destination subnet the rule matches.
    pub subnet: Ipv4Net,
    /// Shape for matching traffic.
    #[serde(flatten)]
    pub shape: LinkShape,
}

impl LinkRule {
    /// Create a rule for a subnet.
    #[must_use]
    pub fn new(subnet: Ipv4Net, shape: LinkShape) -> Self {
        Self { subnet, shape }
    }
}

/// Default routing action for traffic outside the protected baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    /// Route it through the captured uplink.
    Allow,
    /// Leave it unroutable.
    #[default]
    Deny,
}

impl PolicyAction {
    /// The opposite action, taken by exceptions.
    #[must_use]
    pub const fn inverse(self) -> Self {
        match self {
            Self::Allow => Self::Deny,
            Self::Deny => Self::Allow,
        }
    }
}

/// Routing policy for a container's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutingPolicy {
    /// Action for destinations outside the baseline.
    pub default: PolicyAction,
    /// Destinations that take the inverse of `default`.
    pub exceptions: Vec<Ipv4Net>,
}

impl RoutingPolicy {
    /// Allow everything.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            default: PolicyAction::Allow,
            exceptions: Vec::new(),
        }
    }

    /// Deny everything outside the baseline.
    #[must_use]
    pub fn deny_all() -> Self {
        Self {
            default: PolicyAction::Deny,
            exceptions: Vec::new(),
        }
    }

    /// Add an exception.
    #[must_use]
    pub fn except(mut self, destination: Ipv4Net) -> Self {
        self.exceptions.push(destination);
        self
    }
}

impl<'de> Deserialize<'de> for RoutingPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Full {
            #[serde(default)]
            default: PolicyAction,
            #[serde(default)]
            exceptions: Vec<Ipv4Net>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Shorthand(String),
            Full(Full),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Shorthand(s) => match s.as_str() {
                "allow_all" => Ok(Self::allow_all()),
                "deny_all" => Ok(Self::deny_all()),
                other => Err(serde::de::Error::custom(format!(
                    "unknown routing policy '{other}', expected 'allow_all' or 'deny_all'"
                ))),
            },
            Raw::Full(full) => Ok(Self {
                default: full.default,
                exceptions: full.exceptions,
            }),
        }
    }
}

/// Desired state of one managed network for one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Name of the network to configure.
    pub network: String,
    /// Whether the container should be attached.
    pub enable: bool,
    /// Requested IPv4 address; allocated from the subnet pool when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Net>,
    /// Requested IPv6 address. Never supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Net>,
    /// Shape for traffic not matched by any rule.
    #[serde(default)]
    pub default: LinkShape,
    /// Per-subnet overrides, first match wins.
    #[serde(default)]
    pub rules: Vec<LinkRule>,
    /// Routing policy.
    #[serde(default)]
    pub routing_policy: RoutingPolicy,
    /// Opaque label echoed back once the config has been applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_state: Option<String>,
}

impl NetworkConfig {
    /// Create an enabled config for a network with defaults everywhere else.
    #[must_use]
    pub fn enabled(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            enable: true,
            ipv4: None,
            ipv6: None,
            default: LinkShape::default(),
            rules: Vec::new(),
            routing_policy: RoutingPolicy::default(),
            callback_state: None,
        }
    }

    /// Create a config that detaches a network.
    #[must_use]
    pub fn disabled(network: impl Into<String>) -> Self {
        Self {
            enable: false,
            ..Self::enabled(network)
        }
    }

    /// Request a fixed IPv4 address.
    #[must_use]
    pub fn with_ipv4(mut self, addr: Ipv4Net) -> Self {
        self.ipv4 = Some(addr);
        self
    }

    /// Set the default shape.
    #[must_use]
    pub fn with_default(mut self, shape: LinkShape) -> Self {
        self.default = shape;
        self
    }

    /// Append a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: LinkRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Set the routing policy.
    #[must_use]
    pub fn with_routing_policy(mut self, policy: RoutingPolicy) -> Self {
        self.routing_policy = policy;
        self
    }

    /// Validate every shape in this config.
    ///
    /// # Errors
    ///
    /// Returns the first shape validation failure.
    pub fn validate(&self) -> MeshbedResult<()> {
        self.default.validate()?;
        for rule in &self.rules {
            rule.shape.validate()?;
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
