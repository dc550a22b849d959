// FLOOD HUB — ENGINE: CONFIGURATION
// Command line first, then HUB_* environment variables, then defaults.

use std::fmt;

use crate::engine::scheduler::DRAIN_INTERVAL_NS;
use crate::network::MAX_PORTS;

pub const DEFAULT_POOL_FRAMES: usize = 8191;
pub const DEFAULT_FRAME_SIZE: usize = 2048;
pub const MIN_FRAME_SIZE: usize = 64;
pub const MAX_FRAME_SIZE: usize = 16384;

pub const USAGE: &str = "\
usage: flood-hub [options] <iface> <iface> [<iface> ...]

Floods every frame received on one interface out of all the others.
Requires an even number of interfaces (2..=16) and CAP_NET_RAW.

options:
  --core N          pin the datapath to CPU N            (env HUB_CORE)
  --drain-us N      transmit drain interval, default 100 (env HUB_DRAIN_US)
  --pool-frames N   frames per port, default 8191        (env HUB_POOL_FRAMES)
  --frame-size N    bytes per frame, default 2048        (env HUB_FRAME_SIZE)
  -h, --help        show this text

log filter: RUST_LOG (default info)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub interfaces: Vec<String>,
    pub core: Option<usize>,
    pub drain_us: u64,
    pub pool_frames: usize,
    pub frame_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Help,
    MissingValue(&'static str),
    InvalidValue { key: &'static str, value: String },
    UnknownFlag(String),
    /// Fewer than two, an odd number, or more than MAX_PORTS interfaces.
    PortCount(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Help => write!(f, "help requested"),
            ConfigError::MissingValue(key) => write!(f, "{} needs a value", key),
            ConfigError::InvalidValue { key, value } => write!(f, "invalid value {:?} for {}", value, key),
            ConfigError::UnknownFlag(flag) => write!(f, "unknown option {}", flag),
            ConfigError::PortCount(n) => write!(f,
                "number of ports must be even and between 2 and {} (got {})", MAX_PORTS, n),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_num<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue { key, value: value.to_string() })
}

impl HubConfig {
    pub fn from_env_args() -> Result<Self, ConfigError> {
        Self::from_args(std::env::args().skip(1), |k| std::env::var(k).ok())
    }

    /// `args` excludes the program name. `env` looks up HUB_* variables.
    pub fn from_args<I, E>(args: I, env: E) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
        E: Fn(&str) -> Option<String>,
    {
        let mut interfaces = Vec::new();
        let mut core: Option<String> = None;
        let mut drain_us: Option<String> = None;
        let mut pool_frames: Option<String> = None;
        let mut frame_size: Option<String> = None;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let slot = match arg.as_str() {
                "-h" | "--help" => return Err(ConfigError::Help),
                "--core" => Some((&mut core, "--core")),
                "--drain-us" => Some((&mut drain_us, "--drain-us")),
                "--pool-frames" => Some((&mut pool_frames, "--pool-frames")),
                "--frame-size" => Some((&mut frame_size, "--frame-size")),
                other if other.starts_with('-') => return Err(ConfigError::UnknownFlag(other.to_string())),
                _ => None,
            };
            match slot {
                Some((dst, key)) => *dst = Some(args.next().ok_or(ConfigError::MissingValue(key))?),
                None => interfaces.push(arg),
            }
        }

        let core = core.or_else(|| env("HUB_CORE"));
        let drain_us = drain_us.or_else(|| env("HUB_DRAIN_US"));
        let pool_frames = pool_frames.or_else(|| env("HUB_POOL_FRAMES"));
        let frame_size = frame_size.or_else(|| env("HUB_FRAME_SIZE"));

        let cfg = HubConfig {
            core: core.as_deref().map(|v| parse_num("core", v)).transpose()?,
            drain_us: drain_us.as_deref().map(|v| parse_num("drain-us", v)).transpose()?
                .unwrap_or(DRAIN_INTERVAL_NS / 1000),
            pool_frames: pool_frames.as_deref().map(|v| parse_num("pool-frames", v)).transpose()?
                .unwrap_or(DEFAULT_POOL_FRAMES),
            frame_size: frame_size.as_deref().map(|v| parse_num("frame-size", v)).transpose()?
                .unwrap_or(DEFAULT_FRAME_SIZE),
            interfaces,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let n = self.interfaces.len();
        if n < 2 || n % 2 != 0 || n > MAX_PORTS {
            return Err(ConfigError::PortCount(n));
        }
        if let Some(core) = self.core {
            if core >= libc::CPU_SETSIZE as usize {
                return Err(ConfigError::InvalidValue { key: "core", value: core.to_string() });
            }
        }
        if self.drain_us == 0 || self.drain_us > u64::MAX / 1000 {
            return Err(ConfigError::InvalidValue { key: "drain-us", value: self.drain_us.to_string() });
        }
        if self.pool_frames == 0 || self.pool_size() > u32::MAX as usize {
            return Err(ConfigError::InvalidValue { key: "pool-frames", value: self.pool_frames.to_string() });
        }
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.frame_size) {
            return Err(ConfigError::InvalidValue { key: "frame-size", value: self.frame_size.to_string() });
        }
        Ok(())
    }

    pub fn drain_interval_ns(&self) -> u64 { self.drain_us * 1000 }

    /// Frames in the shared pool: `pool_frames` per port.
    pub fn pool_size(&self) -> usize { self.pool_frames.saturating_mul(self.interfaces.len()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> { list.iter().map(|s| s.to_string()).collect() }
    fn no_env(_: &str) -> Option<String> { None }

    #[test]
    fn defaults_with_two_ports() {
        let cfg = HubConfig::from_args(args(&["eth0", "eth1"]), no_env).unwrap();
        assert_eq!(cfg.interfaces, vec!["eth0", "eth1"]);
        assert_eq!(cfg.core, None);
        assert_eq!(cfg.drain_interval_ns(), 100_000);
        assert_eq!(cfg.pool_size(), 2 * DEFAULT_POOL_FRAMES);
        assert_eq!(cfg.frame_size, DEFAULT_FRAME_SIZE);
    }

    #[test]
    fn flags_override_environment() {
        let env = |k: &str| match k {
            "HUB_CORE" => Some("3".to_string()),
            "HUB_DRAIN_US" => Some("250".to_string()),
            _ => None,
        };
        let cfg = HubConfig::from_args(args(&["--drain-us", "50", "a", "b", "c", "d"]), env).unwrap();
        assert_eq!(cfg.core, Some(3));
        assert_eq!(cfg.drain_us, 50);
        assert_eq!(cfg.interfaces.len(), 4);
    }

    #[test]
    fn port_count_precondition() {
        for list in [&["eth0"][..], &["a", "b", "c"][..], &[][..]] {
            let err = HubConfig::from_args(args(list), no_env).unwrap_err();
            assert_eq!(err, ConfigError::PortCount(list.len()));
        }
        let many: Vec<String> = (0..18).map(|i| format!("veth{}", i)).collect();
        assert_eq!(HubConfig::from_args(many, no_env).unwrap_err(), ConfigError::PortCount(18));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert_eq!(
            HubConfig::from_args(args(&["--core", "x", "a", "b"]), no_env).unwrap_err(),
            ConfigError::InvalidValue { key: "core", value: "x".to_string() },
        );
        assert!(matches!(
            HubConfig::from_args(args(&["--drain-us", "0", "a", "b"]), no_env),
            Err(ConfigError::InvalidValue { key: "drain-us", .. })
        ));
        assert!(matches!(
            HubConfig::from_args(args(&["--frame-size", "32", "a", "b"]), no_env),
            Err(ConfigError::InvalidValue { key: "frame-size", .. })
        ));
        assert_eq!(
            HubConfig::from_args(args(&["a", "b", "--pool-frames"]), no_env).unwrap_err(),
            ConfigError::MissingValue("--pool-frames"),
        );
        assert_eq!(
            HubConfig::from_args(args(&["--promisc", "a", "b"]), no_env).unwrap_err(),
            ConfigError::UnknownFlag("--promisc".to_string()),
        );
    }

    #[test]
    fn core_beyond_cpu_set_is_rejected() {
        let too_big = libc::CPU_SETSIZE as usize;
        let (over, last) = (too_big.to_string(), (too_big - 1).to_string());
        assert_eq!(
            HubConfig::from_args(args(&["--core", over.as_str(), "a", "b"]), no_env).unwrap_err(),
            ConfigError::InvalidValue { key: "core", value: too_big.to_string() },
        );
        let env = |k: &str| (k == "HUB_CORE").then(|| "100000".to_string());
        assert!(matches!(
            HubConfig::from_args(args(&["a", "b"]), env),
            Err(ConfigError::InvalidValue { key: "core", .. })
        ));
        let cfg = HubConfig::from_args(args(&["--core", last.as_str(), "a", "b"]), no_env).unwrap();
        assert_eq!(cfg.core, Some(too_big - 1));
    }

    #[test]
    fn help_short_circuits() {
        assert_eq!(HubConfig::from_args(args(&["a", "-h"]), no_env).unwrap_err(), ConfigError::Help);
    }
}
