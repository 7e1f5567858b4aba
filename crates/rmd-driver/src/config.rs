use crate::{AddressLayout, DriverError, Result, TelemetryScale};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Retry policy for commands that wait for an acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Handshake {
    /// Sends per device, including the first.
    pub attempts: u32,
    /// How long each attempt waits for the echo before the next one.
    pub ack_timeout_ms: u64,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            attempts: 3,
            ack_timeout_ms: 300,
        }
    }
}

impl Handshake {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomingConfig {
    pub position_deg: f64,
    pub speed_dps: u16,
    pub handshake: Handshake,
    /// Quiet period after the home commands before tracking starts.
    pub settle_ms: u64,
}

impl Default for HomingConfig {
    fn default() -> Self {
        Self {
            position_deg: 0.0,
            speed_dps: 500,
            handshake: Handshake::default(),
            settle_ms: 3000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// 0x80: motor off, state cleared.
    #[default]
    Stop,
    /// 0x81: hold brake engaged.
    Brake,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoppingConfig {
    pub mode: StopMode,
    pub handshake: Handshake,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub period_ms: u64,
    /// Leave Running after this long; runs until stopped when absent.
    pub run_for_ms: Option<u64>,
    /// Track with 0xA4 and this cap instead of plain 0xA3.
    pub tracking_speed_cap_dps: Option<u16>,
    /// Pause between devices inside one tick.
    pub inter_send_gap_us: u64,
    pub homing: HomingConfig,
    pub stopping: StoppingConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            period_ms: 10,
            run_for_ms: None,
            tracking_speed_cap_dps: None,
            inter_send_gap_us: 0,
            homing: HomingConfig::default(),
            stopping: StoppingConfig::default(),
        }
    }
}

impl ControlConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn run_for(&self) -> Option<Duration> {
        self.run_for_ms.map(Duration::from_millis)
    }

    pub fn inter_send_gap(&self) -> Duration {
        Duration::from_micros(self.inter_send_gap_us)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.homing.settle_ms)
    }
}

/// Deployment configuration of the driver, usually read from YAML.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub addresses: AddressLayout,
    pub scale: TelemetryScale,
    pub control: ControlConfig,
    /// Upper bound on one blocking receive in the transport pump.
    pub rx_timeout_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            addresses: AddressLayout::default(),
            scale: TelemetryScale::default(),
            control: ControlConfig::default(),
            rx_timeout_ms: 10,
        }
    }
}

impl DriverConfig {
    pub fn rx_timeout(&self) -> Duration {
        Duration::from_millis(self.rx_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| -> Result<()> { Err(DriverError::Config(msg.to_string())) };
        let c = &self.control;
        if c.period_ms == 0 {
            return invalid("control.period_ms must be positive");
        }
        if c.run_for_ms == Some(0) {
            return invalid("control.run_for_ms must be positive when set");
        }
        if c.homing.handshake.attempts == 0 || c.stopping.handshake.attempts == 0 {
            return invalid("handshake attempts must be at least 1");
        }
        if !c.homing.position_deg.is_finite() {
            return invalid("control.homing.position_deg must be finite");
        }
        for (name, v) in [
            ("scale.current_amps_per_lsb", self.scale.current_amps_per_lsb),
            ("scale.position_deg_per_lsb", self.scale.position_deg_per_lsb),
        ] {
            if !v.is_finite() || v == 0.0 {
                return Err(DriverError::Config(format!("{name} must be finite and non-zero")));
            }
        }
        if self.rx_timeout_ms == 0 {
            return invalid("rx_timeout_ms must be positive");
        }
        self.addresses.validate()
    }
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<DriverConfig> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
    let config: DriverConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing yaml: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating config: {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_bus_conventions() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.addresses.command_base, 0x140);
        assert_eq!(cfg.addresses.reply_base, 0x240);
        assert_eq!(cfg.addresses.broadcast, 0x280);
        assert_eq!(cfg.addresses.set_id, 0x300);
        assert_eq!(cfg.control.period(), Duration::from_millis(10));
        assert_eq!(cfg.control.homing.handshake.attempts, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() -> anyhow::Result<()> {
        let yaml = r#"
scale:
  position_deg_per_lsb: 0.01
control:
  period_ms: 5
  tracking_speed_cap_dps: 720
  stopping:
    mode: brake
"#;
        let cfg: DriverConfig = serde_yaml::from_str(yaml)?;
        assert_eq!(cfg.scale.position_deg_per_lsb, 0.01);
        assert_eq!(cfg.scale.current_amps_per_lsb, 0.01);
        assert_eq!(cfg.control.period_ms, 5);
        assert_eq!(cfg.control.tracking_speed_cap_dps, Some(720));
        assert_eq!(cfg.control.stopping.mode, StopMode::Brake);
        assert_eq!(cfg.control.stopping.handshake, Handshake::default());
        assert_eq!(cfg.rx_timeout_ms, 10);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = DriverConfig::default();
        cfg.control.period_ms = 0;
        assert!(matches!(cfg.validate(), Err(DriverError::Config(_))));

        let mut cfg = DriverConfig::default();
        cfg.control.homing.handshake.attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = DriverConfig::default();
        cfg.scale.current_amps_per_lsb = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_out_of_range_addresses_fail_validation() -> anyhow::Result<()> {
        let cfg: DriverConfig = serde_yaml::from_str("addresses:\n  reply_base: 65500\n")?;
        assert!(matches!(cfg.validate(), Err(DriverError::Config(_))));

        let cfg: DriverConfig = serde_yaml::from_str("addresses:\n  set_id: 4096\n")?;
        assert!(cfg.validate().is_err());

        let cfg: DriverConfig = serde_yaml::from_str("addresses:\n  command_base: 1792\n")?;
        assert!(cfg.validate().is_ok());
        Ok(())
    }

    #[test]
    fn test_load_config_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "control:\n  period_ms: 20\n  run_for_ms: 1000")?;
        let cfg = load_config_file(file.path())?;
        assert_eq!(cfg.control.run_for(), Some(Duration::from_secs(1)));

        let mut bad = tempfile::NamedTempFile::new()?;
        writeln!(bad, "control:\n  period_ms: 0")?;
        let err = load_config_file(bad.path()).unwrap_err();
        assert!(format!("{err:#}").contains("period_ms"));
        Ok(())
    }
}
