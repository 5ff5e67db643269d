//! Static server/volume registry.
//!
//! The registry is loaded once per run from a JSON document mapping server
//! names to their metering endpoint and the volumes collected from them:
//!
//! ```json
//! {
//!   "holysfdb01": {
//!     "url": "https://holysfdb01.example.edu",
//!     "kind": "starfish",
//!     "volumes": { "holylfs04": ["HDD/C/LABS"], "holylfs05": [] }
//!   },
//!   "quota01": {
//!     "url": "https://quota01.example.edu",
//!     "kind": "quota_report",
//!     "volumes": ["scratch"]
//!   }
//! }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;
use url::Url;

use crate::error::ConfigError;

/// Response schema spoken by a metering server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    /// Starfish-style async query API.
    #[default]
    Starfish,
    /// Cursor-paginated quota report API.
    QuotaReport,
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starfish => write!(f, "starfish"),
            Self::QuotaReport => write!(f, "quota_report"),
        }
    }
}

/// Identity of a volume: the (server, volume) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId {
    pub server: String,
    pub volume: String,
}

impl VolumeId {
    #[must_use]
    pub fn new(server: impl Into<String>, volume: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            volume: volume.into(),
        }
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.server, self.volume)
    }
}

/// A volume to collect usage for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub server_name: String,
    pub volume_name: String,
    /// Base URL of the server's metering API.
    pub endpoint_url: Url,
    pub kind: ServerKind,
    /// Sub-paths of the volume to query. Empty means the whole volume.
    pub paths: Vec<String>,
}

impl VolumeSpec {
    #[must_use]
    pub fn id(&self) -> VolumeId {
        VolumeId::new(&self.server_name, &self.volume_name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerEntry {
    url: String,
    #[serde(default)]
    kind: ServerKind,
    volumes: VolumeList,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VolumeList {
    Names(Vec<String>),
    WithPaths(OrderedPairs<Vec<String>>),
}

impl VolumeList {
    fn into_pairs(self) -> Vec<(String, Vec<String>)> {
        match self {
            Self::Names(names) => names.into_iter().map(|n| (n, Vec::new())).collect(),
            Self::WithPaths(pairs) => pairs.0,
        }
    }
}

/// A JSON object read as its key/value pairs in document order. Repeated
/// keys are kept so validation can reject them.
#[derive(Debug)]
struct OrderedPairs<V>(Vec<(String, V)>);

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedPairs<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PairsVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for PairsVisitor<V> {
            type Value = OrderedPairs<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut pairs = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(pair) = map.next_entry()? {
                    pairs.push(pair);
                }
                Ok(OrderedPairs(pairs))
            }
        }

        deserializer.deserialize_map(PairsVisitor(PhantomData))
    }
}

/// Ordered, validated set of configured volumes.
#[derive(Debug, Clone)]
pub struct VolumeRegistry {
    volumes: Vec<Arc<VolumeSpec>>,
}

impl VolumeRegistry {
    /// Load the registry from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate a registry document.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let OrderedPairs(mut servers) = serde_json::from_str::<OrderedPairs<ServerEntry>>(content)?;
        if servers.is_empty() {
            return Err(ConfigError::Empty);
        }
        servers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut volumes = Vec::new();
        let mut seen_servers = HashSet::new();
        for (server, entry) in servers {
            if server.trim().is_empty() {
                return Err(ConfigError::InvalidServer {
                    server,
                    reason: "server name is empty".to_string(),
                });
            }
            if !seen_servers.insert(server.clone()) {
                return Err(ConfigError::InvalidServer {
                    server,
                    reason: "server declared twice".to_string(),
                });
            }

            let endpoint_url = parse_endpoint(&server, &entry.url)?;
            let mut seen = HashSet::new();

            for (volume, paths) in entry.volumes.into_pairs() {
                if volume.trim().is_empty() {
                    return Err(ConfigError::InvalidServer {
                        server,
                        reason: "volume name is empty".to_string(),
                    });
                }
                if !seen.insert(volume.clone()) {
                    return Err(ConfigError::InvalidServer {
                        server,
                        reason: format!("volume '{volume}' declared twice"),
                    });
                }
                volumes.push(Arc::new(VolumeSpec {
                    server_name: server.clone(),
                    volume_name: volume,
                    endpoint_url: endpoint_url.clone(),
                    kind: entry.kind,
                    paths,
                }));
            }
        }

        if volumes.is_empty() {
            return Err(ConfigError::Empty);
        }

        debug!(count = volumes.len(), "Loaded volume registry");
        Ok(Self { volumes })
    }

    /// All configured volumes, ordered by server name, then in declaration
    /// order within each server.
    #[must_use]
    pub fn volumes(&self) -> &[Arc<VolumeSpec>] {
        &self.volumes
    }

    /// Volumes named `volume_name`, across all servers that declare it.
    pub fn filter(&self, volume_name: &str) -> Result<Vec<Arc<VolumeSpec>>, ConfigError> {
        let matched: Vec<_> = self
            .volumes
            .iter()
            .filter(|v| v.volume_name == volume_name)
            .cloned()
            .collect();
        if matched.is_empty() {
            return Err(ConfigError::UnknownVolume(volume_name.to_string()));
        }
        Ok(matched)
    }

    /// All volumes, or only `volume` when given.
    pub fn select(&self, volume: Option<&str>) -> Result<Vec<Arc<VolumeSpec>>, ConfigError> {
        match volume {
            Some(name) => self.filter(name),
            None => Ok(self.volumes.clone()),
        }
    }

    /// Look up a volume by identity.
    #[must_use]
    pub fn get(&self, id: &VolumeId) -> Option<Arc<VolumeSpec>> {
        self.volumes
            .iter()
            .find(|v| v.server_name == id.server && v.volume_name == id.volume)
            .cloned()
    }
}

fn parse_endpoint(server: &str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidServer {
        server: server.to_string(),
        reason: format!("invalid url '{raw}': {e}"),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidServer {
            server: server.to_string(),
            reason: format!("unsupported url scheme '{}'", url.scheme()),
        });
    }
    Ok(url)
}
