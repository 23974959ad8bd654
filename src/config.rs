use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use crate::packet::{EncodeOptions, HEADER_LEN, MAX_PACKET_SIZE};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: RelaySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelaySettings {
    /// Upstream resolver every query is relayed to.
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// Local address the per-query relay socket binds to.
    #[serde(default = "default_relay_bind")]
    pub relay_bind: String,
    /// Destination port that marks a tunnel packet as a DNS query.
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_reconnect_wait_ms")]
    pub reconnect_wait_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Upstream wait in milliseconds; 0 waits forever.
    #[serde(default)]
    pub upstream_timeout_ms: u64,
    /// Fill in IPv4 and UDP checksums on replies instead of leaving them zero.
    #[serde(default)]
    pub compute_checksums: bool,
    #[serde(default)]
    pub protect: ProtectSettings,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            upstream: default_upstream(),
            relay_bind: default_relay_bind(),
            dns_port: default_dns_port(),
            max_packet_size: default_max_packet_size(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
            reconnect_wait_ms: default_reconnect_wait_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            upstream_timeout_ms: 0,
            compute_checksums: false,
            protect: ProtectSettings::default(),
        }
    }
}

/// Socket options that keep relay traffic from being routed back into the tunnel.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct ProtectSettings {
    /// Bind the relay socket to this interface (SO_BINDTODEVICE).
    #[serde(default)]
    pub bind_device: Option<String>,
    /// Mark relay packets so policy routing can steer them (SO_MARK).
    #[serde(default)]
    pub fwmark: Option<u32>,
}

impl RelaySettings {
    pub fn upstream_addr(&self) -> Result<SocketAddr> {
        self.upstream
            .parse()
            .with_context(|| format!("parse upstream address: {}", self.upstream))
    }

    pub fn relay_bind_addr(&self) -> Result<SocketAddr> {
        self.relay_bind
            .parse()
            .with_context(|| format!("parse relay bind address: {}", self.relay_bind))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn upstream_timeout(&self) -> Option<Duration> {
        (self.upstream_timeout_ms > 0).then(|| Duration::from_millis(self.upstream_timeout_ms))
    }

    pub fn encode_options(&self) -> EncodeOptions {
        EncodeOptions {
            max_packet_size: self.max_packet_size,
            compute_checksums: self.compute_checksums,
        }
    }

    fn validate(&self) -> Result<()> {
        let upstream = self.upstream_addr()?;
        let bind = self.relay_bind_addr()?;
        if upstream.is_ipv4() != bind.is_ipv4() {
            anyhow::bail!(
                "relay_bind {} and upstream {} are different address families",
                bind,
                upstream
            );
        }
        if self.max_packet_size < HEADER_LEN || self.max_packet_size > MAX_PACKET_SIZE {
            anyhow::bail!(
                "max_packet_size must be between {} and {}, got {}",
                HEADER_LEN,
                MAX_PACKET_SIZE,
                self.max_packet_size
            );
        }
        if self.keepalive_interval_ms == 0 {
            anyhow::bail!("keepalive_interval_ms must be non-zero");
        }
        if self.receive_timeout_ms == 0 {
            anyhow::bail!("receive_timeout_ms must be non-zero");
        }
        Ok(())
    }
}

pub fn parse_config(raw: &str) -> Result<RelayConfig> {
    let cfg: RelayConfig = serde_json::from_str(raw)?;
    cfg.settings.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg = parse_config(&raw).with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_settings_take_defaults() {
        let cfg = parse_config("{}").expect("parse config");
        let s = &cfg.settings;
        assert_eq!(s.upstream, "8.8.8.8:53");
        assert_eq!(s.dns_port, 53);
        assert_eq!(s.max_packet_size, 32767);
        assert_eq!(s.keepalive_interval(), Duration::from_secs(15));
        assert_eq!(s.receive_timeout(), Duration::from_secs(20));
        assert_eq!(s.reconnect_wait(), Duration::from_secs(3));
        assert_eq!(s.max_reconnect_attempts, 10);
        assert_eq!(s.upstream_timeout(), None);
        assert!(!s.compute_checksums);
        assert_eq!(s.protect, ProtectSettings::default());
    }

    #[test]
    fn explicit_settings_override_defaults() {
        let raw = json!({
            "version": "test",
            "settings": {
                "upstream": "1.1.1.1:53",
                "upstream_timeout_ms": 1500,
                "compute_checksums": true,
                "protect": { "bind_device": "eth0", "fwmark": 255 }
            }
        });
        let cfg = parse_config(&raw.to_string()).expect("parse config");
        let s = &cfg.settings;
        assert_eq!(s.upstream_addr().unwrap(), "1.1.1.1:53".parse().unwrap());
        assert_eq!(s.upstream_timeout(), Some(Duration::from_millis(1500)));
        assert!(s.encode_options().compute_checksums);
        assert_eq!(s.protect.bind_device.as_deref(), Some("eth0"));
        assert_eq!(s.protect.fwmark, Some(255));
        // untouched fields keep defaults
        assert_eq!(s.relay_bind, "0.0.0.0:0");
    }

    #[test]
    fn shipped_config_parses() {
        let cfg = parse_config(include_str!("../config/relay.json")).expect("sample config");
        assert!(cfg.settings.compute_checksums);
        assert_eq!(cfg.settings.protect, ProtectSettings::default());
    }

    #[test]
    fn ipv6_upstream_needs_ipv6_bind() {
        let raw = json!({
            "settings": {
                "upstream": "[2001:4860:4860::8888]:53",
                "relay_bind": "[::]:0"
            }
        });
        let cfg = parse_config(&raw.to_string()).expect("matching families");
        assert!(cfg.settings.upstream_addr().unwrap().is_ipv6());
    }

    #[test]
    fn invalid_values_are_rejected() {
        for raw in [
            json!({ "settings": { "upstream": "not-an-addr" } }),
            json!({ "settings": { "max_packet_size": 10 } }),
            json!({ "settings": { "max_packet_size": 70000 } }),
            json!({ "settings": { "receive_timeout_ms": 0 } }),
            json!({ "settings": { "upstream": "[2001:4860:4860::8888]:53" } }),
        ] {
            assert!(parse_config(&raw.to_string()).is_err(), "accepted {raw}");
        }
    }
}

fn default_upstream() -> String {
    "8.8.8.8:53".to_string()
}

fn default_relay_bind() -> String {
    "0.0.0.0:0".to_string()
}

fn default_dns_port() -> u16 {
    53
}

fn default_max_packet_size() -> usize {
    MAX_PACKET_SIZE
}

fn default_keepalive_interval_ms() -> u64 {
    15_000
}

fn default_receive_timeout_ms() -> u64 {
    20_000
}

fn default_reconnect_wait_ms() -> u64 {
    3_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}
