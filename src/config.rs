// Configuration schema for the qport queue library.

use std::{
    env, fmt, fs,
    io::{self, Read},
    net::Ipv4Addr,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use thiserror::Error;

use crate::packet::MacAddr;

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// High-level configuration loaded at startup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Packet-backend tunables and the MAC↔IPv4 address table.
    pub packet: PacketConfig,
    /// Stream-backend tunables.
    pub stream: StreamConfig,
}

impl Config {
    /// Loads configuration from `QPORT_CONFIG` if set, otherwise returns
    /// defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var("QPORT_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_missing) => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Builds the immutable address table from the configured neighbors.
    pub fn addr_table(&self) -> Result<AddrTable, ConfigError> {
        AddrTable::from_neighbors(&self.packet.neighbors)
    }

    /// Validates the configuration, returning an error when constraints are
    /// violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.packet.validate()?;
        self.addr_table()?;
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Packet-backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacketConfig {
    /// Largest IP packet the device will carry.
    pub mtu: usize,
    /// Frames pulled from the device per receive burst.
    pub rx_burst: usize,
    /// Static MAC↔IPv4 neighbor entries.
    pub neighbors: Vec<Neighbor>,
}

impl PacketConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < 576 {
            return Err(ConfigError::Validation(format!(
                "mtu {} below the IPv4 minimum of 576",
                self.mtu
            )));
        }
        if self.rx_burst == 0 {
            return Err(ConfigError::Validation(
                "rx_burst must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            rx_burst: 64,
            neighbors: Vec::new(),
        }
    }
}

/// One static neighbor entry.
#[derive(Debug, Clone, Deserialize)]
pub struct Neighbor {
    /// MAC address, colon-separated hex.
    pub mac: String,
    /// IPv4 address owned by that MAC.
    pub ip: Ipv4Addr,
}

/// Stream-backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Whether new stream sockets get TCP_NODELAY.
    pub nodelay: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

/// Process-wide immutable MAC↔IPv4 table.
///
/// Consulted to fill source addresses when a queue is unbound and to fill
/// destination MACs when no routing is available. Unknown IPs resolve to the
/// Ethernet broadcast address; unknown MACs have no derived IP.
#[derive(Debug, Clone, Default)]
pub struct AddrTable {
    entries: Vec<(MacAddr, Ipv4Addr)>,
}

impl AddrTable {
    /// Builds a table from pre-parsed pairs.
    pub fn new(entries: Vec<(MacAddr, Ipv4Addr)>) -> Self {
        Self { entries }
    }

    fn from_neighbors(neighbors: &[Neighbor]) -> Result<Self, ConfigError> {
        let mut entries = Vec::with_capacity(neighbors.len());
        for n in neighbors {
            let mac: MacAddr = n
                .mac
                .parse()
                .map_err(|err| ConfigError::Validation(format!("{err}")))?;
            if entries.iter().any(|(m, _)| *m == mac) {
                return Err(ConfigError::Validation(format!(
                    "duplicate neighbor mac {mac}"
                )));
            }
            entries.push((mac, n.ip));
        }
        Ok(Self { entries })
    }

    /// Destination MAC for an IPv4 address; broadcast when unknown.
    pub fn ip_to_mac(&self, ip: Ipv4Addr) -> MacAddr {
        self.entries
            .iter()
            .find(|(_, entry_ip)| *entry_ip == ip)
            .map(|(mac, _)| *mac)
            .unwrap_or(MacAddr::BROADCAST)
    }

    /// IPv4 address derived from a MAC, when the table knows it.
    pub fn mac_to_ip(&self, mac: MacAddr) -> Option<Ipv4Addr> {
        self.entries
            .iter()
            .find(|(entry_mac, _)| *entry_mac == mac)
            .map(|(_, ip)| *ip)
    }
}

impl fmt::Display for AddrTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} neighbor(s)", self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().expect("default config");
        assert_eq!(cfg.packet.mtu, 1500);
        assert!(cfg.stream.nodelay);
    }

    #[test]
    fn parses_neighbor_table() {
        let cfg = Config::from_toml_str(
            r#"
            [packet]
            mtu = 9000
            rx_burst = 32

            [[packet.neighbors]]
            mac = "02:00:00:00:00:aa"
            ip = "10.0.0.5"

            [[packet.neighbors]]
            mac = "02:00:00:00:00:bb"
            ip = "10.0.0.7"
            "#,
        )
        .expect("config");

        let table = cfg.addr_table().expect("table");
        let mac: MacAddr = "02:00:00:00:00:aa".parse().unwrap();
        assert_eq!(table.mac_to_ip(mac), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(
            table.ip_to_mac(Ipv4Addr::new(10, 0, 0, 7)).to_string(),
            "02:00:00:00:00:bb"
        );
    }

    #[test]
    fn unknown_ip_resolves_to_broadcast() {
        let table = AddrTable::default();
        assert!(table.ip_to_mac(Ipv4Addr::new(10, 9, 9, 9)).is_broadcast());
        assert_eq!(table.mac_to_ip(MacAddr([1; 6])), None);
    }

    #[test]
    fn rejects_tiny_mtu() {
        let err = Config::from_toml_str("[packet]\nmtu = 100\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_duplicate_macs() {
        let err = Config::from_toml_str(
            r#"
            [[packet.neighbors]]
            mac = "02:00:00:00:00:aa"
            ip = "10.0.0.5"

            [[packet.neighbors]]
            mac = "02:00:00:00:00:aa"
            ip = "10.0.0.7"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_bad_mac_strings() {
        let err = Config::from_toml_str(
            r#"
            [[packet.neighbors]]
            mac = "not-a-mac"
            ip = "10.0.0.5"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
