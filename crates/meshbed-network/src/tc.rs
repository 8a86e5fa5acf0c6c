//! Traffic-control plans for link shaping.
//!
//! The whole qdisc tree of the data interface is derived from the default
//! shape and the rule list every time either changes:
//!
//! ```text
//! root htb 1: (default 1:1)
//! ├── class 1:1   rate=<default bw>  └── netem 101:  <default shape>
//! ├── class 1:10  rate=<rule 0 bw>   └── netem 110:  <rule 0 shape>   filter prio 1 dst <rule 0 subnet>
//! └── class 1:11  rate=<rule 1 bw>   └── netem 111:  <rule 1 shape>   filter prio 2 dst <rule 1 subnet>
//! ```
//!
//! Handles are written in hex, as `tc` parses them.

use std::fmt;
use std::time::Duration;

use ipnet::Ipv4Net;
use meshbed_common::{Bandwidth, LinkRule, LinkShape};

use crate::error::{NetworkError, NetworkResult};

/// Rate used for classes without a bandwidth limit.
pub const UNLIMITED_RATE: Bandwidth = Bandwidth::gbit(10);

/// Minor number of the default class.
const DEFAULT_CLASS: u16 = 0x1;

/// Minor number of the first rule class.
const FIRST_RULE_CLASS: u16 = 0x10;

/// Major number offset of netem qdiscs below their class.
const NETEM_MAJOR_BASE: u16 = 0x100;

/// Maximum number of rules that fit the handle scheme.
pub const MAX_RULES: usize = (u16::MAX - NETEM_MAJOR_BASE - FIRST_RULE_CLASS) as usize;

/// A `major:minor` traffic-control handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcHandle {
    /// Major number.
    pub major: u16,
    /// Minor number.
    pub minor: u16,
}

impl TcHandle {
    /// Create a handle.
    #[must_use]
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for TcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{:x}:", self.major)
        } else {
            write!(f, "{:x}:{:x}", self.major, self.minor)
        }
    }
}

/// Where a qdisc is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcParent {
    /// The interface root.
    Root,
    /// Below a class.
    Class(TcHandle),
}

/// Network emulation parameters of one netem qdisc.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Netem {
    /// Delay.
    pub delay: Duration,
    /// Delay variation.
    pub jitter: Duration,
    /// Loss percentage.
    pub loss: f32,
    /// Corruption percentage and correlation.
    pub corrupt: (f32, f32),
    /// Reordering percentage and correlation.
    pub reorder: (f32, f32),
    /// Duplication percentage and correlation.
    pub duplicate: (f32, f32),
}

impl From<&LinkShape> for Netem {
    fn from(shape: &LinkShape) -> Self {
        Self {
            delay: shape.latency,
            jitter: shape.jitter,
            loss: shape.loss,
            corrupt: (shape.corrupt, shape.corrupt_corr),
            reorder: (shape.reorder, shape.reorder_corr),
            duplicate: (shape.duplicate, shape.duplicate_corr),
        }
    }
}

impl Netem {
    fn args(&self) -> Vec<String> {
        let mut args = vec!["netem".to_string()];

        if !self.delay.is_zero() || !self.jitter.is_zero() {
            args.push("delay".to_string());
            args.push(micros(self.delay));
            if !self.jitter.is_zero() {
                args.push(micros(self.jitter));
            }
        }
        if self.loss > 0.0 {
            args.push("loss".to_string());
            args.push(percent(self.loss));
        }

        for (name, (value, corr)) in [
            ("corrupt", self.corrupt),
            ("duplicate", self.duplicate),
            ("reorder", self.reorder),
        ] {
            if value > 0.0 {
                args.push(name.to_string());
                args.push(percent(value));
                if corr > 0.0 {
                    args.push(percent(corr));
                }
            }
        }

        args
    }
}

fn micros(d: Duration) -> String {
    format!("{}us", d.as_micros())
}

fn percent(p: f32) -> String {
    format!("{p}%")
}

/// Qdisc flavours used by the plan.
#[derive(Debug, Clone, PartialEq)]
pub enum QdiscKind {
    /// Hierarchical token bucket with a default class.
    Htb {
        /// Minor number of the class unclassified traffic goes to.
        default_class: u16,
    },
    /// Network emulator.
    Netem(Netem),
}

/// One `tc` invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TcCommand {
    /// Remove the root qdisc (and with it the whole tree).
    ResetRoot,
    /// Add a qdisc.
    Qdisc {
        /// Attachment point.
        parent: TcParent,
        /// Handle of the new qdisc.
        handle: TcHandle,
        /// What to add.
        kind: QdiscKind,
    },
    /// Add an HTB class.
    Class {
        /// Parent qdisc or class.
        parent: TcHandle,
        /// ID of the new class.
        classid: TcHandle,
        /// Guaranteed and ceiling rate.
        rate: Bandwidth,
    },
    /// Steer traffic for a destination subnet into a class.
    Filter {
        /// Qdisc the filter is attached to.
        parent: TcHandle,
        /// Priority; lower matches first.
        priority: u16,
        /// Destination subnet.
        destination: Ipv4Net,
        /// Target class.
        flowid: TcHandle,
    },
}

impl TcCommand {
    /// The command that removes the root qdisc.
    #[must_use]
    pub const fn reset_root() -> Self {
        Self::ResetRoot
    }

    /// Arguments for `tc` (without the program name) on device `dev`.
    #[must_use]
    pub fn args(&self, dev: &str) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| (*s).to_string()));

        match self {
            Self::ResetRoot => push(&["qdisc", "del", "dev", dev, "root"]),
            Self::Qdisc {
                parent,
                handle,
                kind,
            } => {
                push(&["qdisc", "add", "dev", dev]);
                match parent {
                    TcParent::Root => push(&["root"]),
                    TcParent::Class(class) => push(&["parent", &class.to_string()]),
                }
                push(&["handle", &handle.to_string()]);
                match kind {
                    QdiscKind::Htb { default_class } => {
                        push(&["htb", "default", &format!("{default_class:x}")]);
                    }
                    QdiscKind::Netem(netem) => {
                        let netem_args = netem.args();
                        let refs: Vec<&str> = netem_args.iter().map(String::as_str).collect();
                        push(&refs);
                    }
                }
            }
            Self::Class {
                parent,
                classid,
                rate,
            } => push(&[
                "class",
                "add",
                "dev",
                dev,
                "parent",
                &parent.to_string(),
                "classid",
                &classid.to_string(),
                "htb",
                "rate",
                &rate.to_string(),
            ]),
            Self::Filter {
                parent,
                priority,
                destination,
                flowid,
            } => push(&[
                "filter",
                "add",
                "dev",
                dev,
                "parent",
                &parent.to_string(),
                "protocol",
                "ip",
                "prio",
                &priority.to_string(),
                "u32",
                "match",
                "ip",
                "dst",
                &destination.to_string(),
                "flowid",
                &flowid.to_string(),
            ]),
        }

        args
    }
}

fn class_commands(root: TcHandle, minor: u16, shape: &LinkShape) -> [TcCommand; 2] {
    let classid = TcHandle::new(root.major, minor);
    let rate = if shape.bandwidth.is_unlimited() {
        UNLIMITED_RATE
    } else {
        shape.bandwidth
    };

    [
        TcCommand::Class {
            parent: root,
            classid,
            rate,
        },
        TcCommand::Qdisc {
            parent: TcParent::Class(classid),
            handle: TcHandle::new(NETEM_MAJOR_BASE + minor, 0),
            kind: QdiscKind::Netem(Netem::from(shape)),
        },
    ]
}

/// Derive the complete qdisc tree for a default shape and a rule list.
///
/// # Errors
///
/// Returns an error if there are more rules than the handle scheme allows.
pub fn plan(default: &LinkShape, rules: &[LinkRule]) -> NetworkResult<Vec<TcCommand>> {
    if rules.len() > MAX_RULES {
        return Err(NetworkError::backend(format!(
            "too many link rules: {} (max {MAX_RULES})",
            rules.len()
        )));
    }

    let root = TcHandle::new(1, 0);
    let mut commands = vec![TcCommand::Qdisc {
        parent: TcParent::Root,
        handle: root,
        kind: QdiscKind::Htb {
            default_class: DEFAULT_CLASS,
        },
    }];
    commands.extend(class_commands(root, DEFAULT_CLASS, default));

    for (i, rule) in (0u16..).zip(rules) {
        let minor = FIRST_RULE_CLASS + i;
        commands.extend(class_commands(root, minor, &rule.shape));
        commands.push(TcCommand::Filter {
            parent: root,
            priority: i + 1,
            destination: rule.subnet.trunc(),
            flowid: TcHandle::new(root.major, minor),
        });
    }

    Ok(commands)
}
