//! Traffic control command construction.
//!
//! A shaped link end gets a token bucket filter as root qdisc for the rate
//! cap and, when delay, jitter, loss or a queue limit is requested, a netem
//! qdisc chained below it:
//!
//! ```text
//! tc -n nemu-h1 qdisc add dev nemu-h1-eth0 root handle 1: tbf rate 15000kbit burst 187500 latency 1s
//! tc -n nemu-h1 qdisc add dev nemu-h1-eth0 parent 1:1 handle 10: netem delay 1ms
//! ```

use std::fmt;

use netemu_shared::ImpairmentProfile;
use netemu_shared::impairment::format_duration;

/// Minimum TBF burst, ten full-size frames
const MIN_BURST_BASE_BYTES: u64 = 15_400;

#[derive(Debug, Clone, PartialEq)]
pub enum Qdisc {
    Tbf { rate_kbit: u64, burst_bytes: u64 },
    Netem { params: Vec<String> },
}

impl fmt::Display for Qdisc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Qdisc::Tbf { .. } => write!(f, "tbf"),
            Qdisc::Netem { .. } => write!(f, "netem"),
        }
    }
}

/// Where a qdisc attaches
#[derive(Debug, Clone, PartialEq)]
pub enum TcParent {
    Root,
    Class(String),
}

/// A single `tc qdisc add` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TcCommand {
    device: String,
    namespace: Option<String>,
    parent: TcParent,
    handle: String,
    qdisc: Qdisc,
}

impl TcCommand {
    pub fn qdisc(&self) -> &Qdisc {
        &self.qdisc
    }

    /// Arguments for the `tc` binary.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ns) = &self.namespace {
            args.extend(["-n".to_string(), ns.clone()]);
        }
        args.extend([
            "qdisc".to_string(),
            "add".to_string(),
            "dev".to_string(),
            self.device.clone(),
        ]);
        match &self.parent {
            TcParent::Root => args.push("root".to_string()),
            TcParent::Class(class) => args.extend(["parent".to_string(), class.clone()]),
        }
        args.extend([
            "handle".to_string(),
            self.handle.clone(),
            self.qdisc.to_string(),
        ]);

        match &self.qdisc {
            Qdisc::Tbf {
                rate_kbit,
                burst_bytes,
            } => {
                args.extend([
                    "rate".to_string(),
                    format!("{}kbit", rate_kbit),
                    "burst".to_string(),
                    burst_bytes.to_string(),
                    "latency".to_string(),
                    "1s".to_string(),
                ]);
            }
            Qdisc::Netem { params } => args.extend(params.iter().cloned()),
        }
        args
    }

    /// Human readable form, for logs and dry runs
    pub fn to_command_string(&self) -> String {
        format!("tc {}", self.args().join(" "))
    }
}

fn rate_kbit(bandwidth_mbps: f64) -> u64 {
    // float to int casts saturate, NaN becomes 0
    ((bandwidth_mbps * 1000.0).round() as u64).max(1)
}

fn burst_bytes(rate_kbit: u64) -> u64 {
    let rate_bytes_per_sec = rate_kbit.saturating_mul(1000) / 8;
    rate_bytes_per_sec.max(MIN_BURST_BASE_BYTES) / 10
}

fn netem_params(profile: &ImpairmentProfile) -> Vec<String> {
    let mut params = Vec::new();

    if let Some(delay) = profile.delay {
        params.push("delay".to_string());
        params.push(format_duration(delay));
        if let Some(jitter) = profile.jitter.filter(|j| !j.is_zero()) {
            params.push(format_duration(jitter));
        }
    }

    if let Some(loss) = profile.loss_percent {
        params.push("loss".to_string());
        params.push(format!("{}%", loss));
    }

    if let Some(limit) = profile.max_queue {
        params.push("limit".to_string());
        params.push(limit.to_string());
    }

    params
}

/// Commands shaping one end of a link. Unshaped profiles produce nothing.
pub fn shaping_commands(
    device: &str,
    namespace: Option<&str>,
    profile: &ImpairmentProfile,
) -> Vec<TcCommand> {
    let Some(bandwidth) = profile.bandwidth_mbps else {
        return Vec::new();
    };

    let rate = rate_kbit(bandwidth);
    let mut commands = vec![TcCommand {
        device: device.to_string(),
        namespace: namespace.map(str::to_string),
        parent: TcParent::Root,
        handle: "1:".to_string(),
        qdisc: Qdisc::Tbf {
            rate_kbit: rate,
            burst_bytes: burst_bytes(rate),
        },
    }];

    let params = netem_params(profile);
    if !params.is_empty() {
        commands.push(TcCommand {
            device: device.to_string(),
            namespace: namespace.map(str::to_string),
            parent: TcParent::Class("1:1".to_string()),
            handle: "10:".to_string(),
            qdisc: Qdisc::Netem { params },
        });
    }

    commands
}
