//! Link impairment profiles.
//!
//! An [`ImpairmentProfile`] describes how a link shapes the traffic crossing it:
//! a bandwidth cap plus the optional delay, jitter, loss and queue limit that are
//! layered on top of it. Profiles without a bandwidth are "unshaped" and may not
//! carry any other impairment, since delay and loss are always composed on top of
//! a rate-limiting qdisc.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::errors::{TopologyError, TopologyResult};

/// Highest accepted bandwidth cap, 1 Tbit/s
pub const MAX_BANDWIDTH_MBPS: f64 = 1_000_000.0;

/// Bandwidth, delay and loss parameters attached to a link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpairmentProfile {
    /// Bandwidth cap in megabits per second
    pub bandwidth_mbps: Option<f64>,
    /// One-way delay
    pub delay: Option<Duration>,
    /// Delay variation, only meaningful together with `delay`
    pub jitter: Option<Duration>,
    /// Packet loss percentage (0.0-100.0)
    pub loss_percent: Option<f64>,
    /// Queue limit in packets
    pub max_queue: Option<u32>,
}

impl ImpairmentProfile {
    /// A profile that leaves the link unshaped.
    pub fn unshaped() -> Self {
        Self::default()
    }

    /// A profile capped at `bandwidth_mbps` with no further impairment.
    pub fn shaped(bandwidth_mbps: f64) -> Self {
        Self {
            bandwidth_mbps: Some(bandwidth_mbps),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn with_loss(mut self, loss_percent: f64) -> Self {
        self.loss_percent = Some(loss_percent);
        self
    }

    pub fn with_max_queue(mut self, packets: u32) -> Self {
        self.max_queue = Some(packets);
        self
    }

    /// True if the profile sets a bandwidth cap.
    pub fn is_shaped(&self) -> bool {
        self.bandwidth_mbps.is_some()
    }

    /// True if delay, jitter or loss has to be emulated on top of the rate cap.
    pub fn has_netem_params(&self) -> bool {
        self.delay.is_some() || self.jitter.is_some() || self.loss_percent.is_some()
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> TopologyResult<()> {
        match self.bandwidth_mbps {
            None => {
                if self.has_netem_params() || self.max_queue.is_some() {
                    return Err(TopologyError::invalid_profile(
                        "bandwidth_mbps",
                        "delay, jitter, loss and queue limits require a bandwidth",
                    ));
                }
                return Ok(());
            }
            Some(bw) => {
                if !bw.is_finite() || bw <= 0.0 {
                    return Err(TopologyError::invalid_profile(
                        "bandwidth_mbps",
                        format!("bandwidth must be a positive number, got {}", bw),
                    ));
                }
                if bw > MAX_BANDWIDTH_MBPS {
                    return Err(TopologyError::invalid_profile(
                        "bandwidth_mbps",
                        format!(
                            "bandwidth must be at most {} Mbit/s, got {}",
                            MAX_BANDWIDTH_MBPS, bw
                        ),
                    ));
                }
            }
        }

        if let Some(loss) = self.loss_percent {
            if !(0.0..=100.0).contains(&loss) {
                return Err(TopologyError::invalid_profile(
                    "loss_percent",
                    format!("loss must be 0.0-100.0, got {}", loss),
                ));
            }
        }

        if self.jitter.is_some() && self.delay.is_none() {
            return Err(TopologyError::invalid_profile(
                "jitter",
                "jitter requires a delay",
            ));
        }

        if self.max_queue == Some(0) {
            return Err(TopologyError::invalid_profile(
                "max_queue",
                "queue limit must be at least one packet",
            ));
        }

        Ok(())
    }
}

/// Mirrors the classic emulator banner, e.g. `15.00Mbit 10ms delay 1.00000% loss`.
impl fmt::Display for ImpairmentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(bw) = self.bandwidth_mbps else {
            return write!(f, "unshaped");
        };

        let mut parts = vec![format!("{:.2}Mbit", bw)];
        if let Some(delay) = self.delay {
            parts.push(format!("{} delay", format_duration(delay)));
        }
        if let Some(jitter) = self.jitter {
            parts.push(format!("{} jitter", format_duration(jitter)));
        }
        if let Some(loss) = self.loss_percent {
            parts.push(format!("{:.5}% loss", loss));
        }
        if let Some(queue) = self.max_queue {
            parts.push(format!("{} max queue", queue));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// Format a duration the way `tc` expects it: whole milliseconds when possible,
/// microseconds otherwise.
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}us", duration.as_micros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unshaped_profile_is_valid() {
        assert!(ImpairmentProfile::unshaped().validate().is_ok());
        assert!(!ImpairmentProfile::unshaped().is_shaped());
    }

    #[test]
    fn test_shaped_profile_with_delay_and_loss() {
        let profile = ImpairmentProfile::shaped(15.0)
            .with_delay(Duration::from_millis(10))
            .with_loss(1.0);
        assert!(profile.validate().is_ok());
        assert!(profile.has_netem_params());
    }

    #[test]
    fn test_bandwidth_must_be_positive() {
        for bw in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let result = ImpairmentProfile::shaped(bw).validate();
            let field = match &result {
                Err(TopologyError::InvalidProfile { field, .. }) => Some(field.as_str()),
                _ => None,
            };
            assert!(
                field == Some("bandwidth_mbps"),
                "bandwidth {} should be rejected, got {:?}",
                bw,
                result
            );
        }
    }

    #[test]
    fn test_bandwidth_upper_bound() {
        assert!(ImpairmentProfile::shaped(MAX_BANDWIDTH_MBPS).validate().is_ok());
        for bw in [MAX_BANDWIDTH_MBPS * 2.0, 1e300] {
            assert!(matches!(
                ImpairmentProfile::shaped(bw).validate(),
                Err(TopologyError::InvalidProfile { ref field, .. }) if field == "bandwidth_mbps"
            ));
        }
    }

    #[test]
    fn test_loss_range() {
        assert!(ImpairmentProfile::shaped(10.0).with_loss(0.0).validate().is_ok());
        assert!(ImpairmentProfile::shaped(10.0).with_loss(100.0).validate().is_ok());
        assert!(ImpairmentProfile::shaped(10.0).with_loss(100.1).validate().is_err());
        assert!(ImpairmentProfile::shaped(10.0).with_loss(-0.5).validate().is_err());
    }

    #[test]
    fn test_impairment_without_bandwidth_is_rejected() {
        let delay_only = ImpairmentProfile::unshaped().with_delay(Duration::from_millis(1));
        assert!(matches!(
            delay_only.validate(),
            Err(TopologyError::InvalidProfile { .. })
        ));

        let loss_only = ImpairmentProfile::unshaped().with_loss(1.0);
        assert!(loss_only.validate().is_err());
    }

    #[test]
    fn test_jitter_requires_delay() {
        let profile = ImpairmentProfile::shaped(10.0).with_jitter(Duration::from_millis(2));
        assert!(profile.validate().is_err());

        let profile = profile.with_delay(Duration::from_millis(20));
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_zero_queue_limit_is_rejected() {
        let profile = ImpairmentProfile::shaped(10.0).with_max_queue(0);
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_display_banner() {
        let profile = ImpairmentProfile::shaped(15.0)
            .with_delay(Duration::from_millis(10))
            .with_loss(1.0);
        assert_eq!(profile.to_string(), "15.00Mbit 10ms delay 1.00000% loss");
        assert_eq!(ImpairmentProfile::unshaped().to_string(), "unshaped");
    }

    #[test]
    fn test_format_duration_units() {
        assert_eq!(format_duration(Duration::from_millis(1)), "1ms");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1500us");
        assert_eq!(format_duration(Duration::ZERO), "0ms");
    }
}
