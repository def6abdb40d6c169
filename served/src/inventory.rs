//! The on-disk store inventory (`inventory.json`).
//!
//! Two tables: `packs` records what is installed and where, `proofs`
//! records the trust material the verifier checked it against. Proofs
//! are indexed by a caller-chosen key (publisher name or pack
//! signature subject).

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One installed pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pack {
    /// Publishing organization.
    pub publisher: String,
    /// Package name.
    pub package: String,
    /// Target platform, e.g. `linux`.
    pub platform: String,
    /// Target architecture, e.g. `x86_64`.
    pub arch: String,
    /// Release channel, e.g. `stable`.
    pub channel: String,
    /// Pack revision number.
    pub revision: u64,
    /// Where the pack file lives on disk.
    pub path: String,
}

/// Identity of a pack, without its on-disk location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackKey<'a> {
    /// Publishing organization.
    pub publisher: &'a str,
    /// Package name.
    pub package: &'a str,
    /// Target platform.
    pub platform: &'a str,
    /// Target architecture.
    pub arch: &'a str,
    /// Release channel.
    pub channel: &'a str,
    /// Pack revision number.
    pub revision: u64,
}

impl Pack {
    /// Whether this pack matches an identity key.
    fn matches(&self, key: PackKey<'_>) -> bool {
        self.publisher == key.publisher
            && self.package == key.package
            && self.platform == key.platform
            && self.arch == key.arch
            && self.channel == key.channel
            && self.revision == key.revision
    }
}

/// Trust material for a publisher or a single pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proof {
    /// A publisher's key pair record.
    Publisher {
        /// The publisher's public key, encoded.
        public_key: String,
        /// The public key signed by the store root.
        signed_key: String,
    },
    /// A detached signature over one pack.
    Package {
        /// The pack signature, encoded.
        signature: String,
    },
}

/// The whole inventory, as serialized to `inventory.json`.
///
/// `proofs` is an ordered map so repeated saves of the same contents
/// produce identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    /// Installed packs, in insertion order.
    pub packs: Vec<Pack>,
    /// Trust proofs, indexed by key.
    pub proofs: BTreeMap<String, Proof>,
}

impl Inventory {
    /// Loads an inventory file; a missing file is an empty inventory.
    pub fn load(path: &Path) -> io::Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Persists the inventory as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        fs::write(path, text)
    }

    /// Records a pack, replacing any existing entry with the same
    /// identity.
    pub fn add_pack(&mut self, pack: Pack) {
        let key = PackKey {
            publisher: &pack.publisher,
            package: &pack.package,
            platform: &pack.platform,
            arch: &pack.arch,
            channel: &pack.channel,
            revision: pack.revision,
        };
        self.packs.retain(|p| !p.matches(key));
        self.packs.push(pack);
    }

    /// Looks a pack up by its identity.
    pub fn get(&self, key: PackKey<'_>) -> Option<&Pack> {
        self.packs.iter().find(|p| p.matches(key))
    }

    /// Removes a pack; returns it if present.
    pub fn remove_pack(&mut self, key: PackKey<'_>) -> Option<Pack> {
        let idx = self.packs.iter().position(|p| p.matches(key))?;
        Some(self.packs.remove(idx))
    }

    /// Inserts a proof under `key` unless one is already recorded.
    ///
    /// Returns `true` when the proof was inserted.
    pub fn ensure_proof(&mut self, key: &str, proof: Proof) -> bool {
        if self.proofs.contains_key(key) {
            return false;
        }
        self.proofs.insert(key.to_owned(), proof);
        true
    }

    /// Looks a proof up by key.
    pub fn lookup_proof(&self, key: &str) -> Option<&Proof> {
        self.proofs.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_pack() -> Pack {
        Pack {
            publisher: "acme".into(),
            package: "hello".into(),
            platform: "linux".into(),
            arch: "x86_64".into(),
            channel: "stable".into(),
            revision: 3,
            path: "/var/lib/chef/packs/hello-3.vafs".into(),
        }
    }

    fn hello_key() -> PackKey<'static> {
        PackKey {
            publisher: "acme",
            package: "hello",
            platform: "linux",
            arch: "x86_64",
            channel: "stable",
            revision: 3,
        }
    }

    #[test]
    fn add_save_load_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");

        let mut inv = Inventory::default();
        inv.add_pack(hello_pack());
        inv.ensure_proof("acme", Proof::Publisher {
            public_key: "pk".into(),
            signed_key: "sk".into(),
        });
        inv.save(&path).unwrap();

        let back = Inventory::load(&path).unwrap();
        assert_eq!(back, inv);
        assert_eq!(back.get(hello_key()), Some(&hello_pack()));
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let inv = Inventory::load(&dir.path().join("nope.json")).unwrap();
        assert!(inv.packs.is_empty());
        assert!(inv.proofs.is_empty());
    }

    #[test]
    fn add_pack_replaces_same_identity() {
        let mut inv = Inventory::default();
        inv.add_pack(hello_pack());
        let mut moved = hello_pack();
        moved.path = "/elsewhere/hello-3.vafs".into();
        inv.add_pack(moved.clone());
        assert_eq!(inv.packs.len(), 1);
        assert_eq!(inv.get(hello_key()), Some(&moved));
    }

    #[test]
    fn ensure_proof_does_not_overwrite() {
        let mut inv = Inventory::default();
        assert!(inv.ensure_proof("acme", Proof::Package {
            signature: "sig-a".into(),
        }));
        assert!(!inv.ensure_proof("acme", Proof::Package {
            signature: "sig-b".into(),
        }));
        assert_eq!(
            inv.lookup_proof("acme"),
            Some(&Proof::Package {
                signature: "sig-a".into()
            })
        );
    }

    #[test]
    fn save_is_byte_stable() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");

        let mut inv = Inventory::default();
        inv.add_pack(hello_pack());
        inv.ensure_proof("zeta", Proof::Package {
            signature: "z".into(),
        });
        inv.ensure_proof("acme", Proof::Publisher {
            public_key: "pk".into(),
            signed_key: "sk".into(),
        });
        inv.save(&a).unwrap();
        Inventory::load(&a).unwrap().save(&b).unwrap();
        assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
    }
}
