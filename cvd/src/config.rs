//! Daemon configuration (`cvd.json`).
//!
//! The file carries two objects: `api-address` selects the RPC socket
//! and `security` sets the default policy plus host path grants. A
//! missing file is replaced by the platform default, which is then
//! persisted so the effective configuration is always inspectable on
//! disk.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use containerv::policy::{AccessMask, PathRule};
use containerv_proto::{DEFAULT_INET_PORT, DEFAULT_LOCAL_ADDRESS};

/// Socket family selector in `api-address.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    /// `AF_UNIX`; abstract namespace when the address starts with `@`.
    Local,
    /// `AF_INET` loopback.
    Inet4,
}

/// The `api-address` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiAddress {
    /// Socket family.
    #[serde(rename = "type")]
    pub kind: AddressKind,
    /// Socket path (local) or IP address (inet4).
    pub address: String,
    /// TCP port; unused for local sockets.
    pub port: u16,
}

/// One host path grant in `security.custom_paths`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomPath {
    /// Host path made visible to containers.
    pub path: String,
    /// Access string, e.g. `"read,execute"`.
    pub access: String,
}

/// The `security` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Security {
    /// Policy plugin names applied when a create request names none.
    pub default_policy: Vec<String>,
    /// Extra host path grants appended to every policy.
    pub custom_paths: Vec<CustomPath>,
}

/// Parsed `cvd.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// RPC socket selection.
    #[serde(rename = "api-address")]
    pub api_address: ApiAddress,
    /// Policy defaults.
    pub security: Security,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_address: default_api_address(),
            security: Security {
                default_policy: vec!["minimal".to_owned()],
                custom_paths: Vec::new(),
            },
        }
    }
}

/// Platform default: abstract local socket on Linux, loopback TCP on
/// Windows.
fn default_api_address() -> ApiAddress {
    if cfg!(windows) {
        ApiAddress {
            kind: AddressKind::Inet4,
            address: "127.0.0.1".to_owned(),
            port: DEFAULT_INET_PORT,
        }
    } else {
        ApiAddress {
            kind: AddressKind::Local,
            address: DEFAULT_LOCAL_ADDRESS.to_owned(),
            port: 0,
        }
    }
}

impl Config {
    /// Loads the config, writing the platform default when the file is
    /// missing.
    pub fn load_or_init(path: &Path) -> io::Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let config = serde_json::from_str(&text)?;
                Ok(config)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(path)?;
                info!(path = %path.display(), "wrote default configuration");
                Ok(config)
            }
            Err(e) => Err(e),
        }
    }

    /// Persists the config as pretty-printed JSON.
    ///
    /// The rendering is deterministic, so save, load, save produces
    /// identical bytes.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        fs::write(path, text)
    }

    /// Parses `security.custom_paths` into policy path rules.
    ///
    /// Entries with an unparseable access string are rejected rather
    /// than silently granted.
    pub fn custom_path_rules(&self) -> containerv::Result<Vec<PathRule>> {
        self.security
            .custom_paths
            .iter()
            .map(|entry| {
                Ok(PathRule {
                    path: entry.path.clone(),
                    access: AccessMask::parse(&entry.access)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_platform_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cvd.json");
        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
        // A second load reads the persisted file back unchanged.
        assert_eq!(Config::load_or_init(&path).unwrap(), config);
    }

    #[test]
    fn save_load_save_is_byte_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.json");
        let second = dir.path().join("b.json");

        let config = Config {
            api_address: ApiAddress {
                kind: AddressKind::Local,
                address: "@/chef/cvd/api".to_owned(),
                port: 0,
            },
            security: Security {
                default_policy: vec!["minimal".to_owned(), "build".to_owned()],
                custom_paths: vec![CustomPath {
                    path: "/opt/tools".to_owned(),
                    access: "read,execute".to_owned(),
                }],
            },
        };
        config.save(&first).unwrap();
        let reloaded = Config::load_or_init(&first).unwrap();
        reloaded.save(&second).unwrap();
        assert_eq!(
            fs::read(&first).unwrap(),
            fs::read(&second).unwrap(),
        );
    }

    #[test]
    fn wire_field_names_match_the_file_format() {
        let text = serde_json::to_string(&Config::default()).unwrap();
        assert!(text.contains("\"api-address\""));
        assert!(text.contains("\"type\""));
        assert!(text.contains("\"default_policy\""));
    }

    #[test]
    fn bad_access_string_is_rejected() {
        let config = Config {
            security: Security {
                default_policy: vec![],
                custom_paths: vec![CustomPath {
                    path: "/x".to_owned(),
                    access: "read,banana".to_owned(),
                }],
            },
            ..Config::default()
        };
        assert!(config.custom_path_rules().is_err());
    }
}
