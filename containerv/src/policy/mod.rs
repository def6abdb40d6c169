//! Container security policy composition.
//!
//! A policy is an ordered list of named plugins. The "minimal" plugin is
//! always applied first and establishes the privilege baseline; every
//! later plugin strictly adds capability, so a plugin can never grant
//! less than its predecessor.
//!
//! The composed [`Policy`] is platform-neutral. Platform interpretation
//! lives in the per-OS submodules: capability masks and bind-mount plans
//! on Linux, restricted tokens and AppContainer isolation on Windows.

#[cfg(unix)]
pub mod linux;
#[cfg(windows)]
pub mod windows;

use crate::{Error, Result};

/// Access mask for a custom-path rule: union of read/write/execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessMask(u8);

impl AccessMask {
    /// Read access.
    pub const READ: Self = Self(0b001);
    /// Write access.
    pub const WRITE: Self = Self(0b010);
    /// Execute access.
    pub const EXEC: Self = Self(0b100);

    /// Union of two masks.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every bit of `other` is present in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parses a comma-separated access string, e.g. `"read,write,execute"`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut mask = Self::default();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            mask = mask.union(match part {
                "read" => Self::READ,
                "write" => Self::WRITE,
                "execute" => Self::EXEC,
                other => return Err(Error::UnknownPlugin(format!("access '{other}'"))),
            });
        }
        Ok(mask)
    }

    /// Renders the mask back into its config-file form.
    pub fn render(self) -> String {
        let mut parts = Vec::new();
        if self.contains(Self::READ) {
            parts.push("read");
        }
        if self.contains(Self::WRITE) {
            parts.push("write");
        }
        if self.contains(Self::EXEC) {
            parts.push("execute");
        }
        parts.join(",")
    }
}

/// One caller-configured path grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    /// Host path the container may access.
    pub path: String,
    /// Granted access.
    pub access: AccessMask,
}

/// Closed set of policy plugin kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginKind {
    /// Baseline privilege drop. Always first; implicit.
    Minimal,
    /// Grants what a package build needs (toolchain paths, scratch space).
    Build,
    /// Grants network access.
    Network,
    /// Windows only: run the workload inside an AppContainer.
    AppContainer,
    /// Extension table of caller-supplied path grants.
    CustomPaths(Vec<PathRule>),
}

impl PluginKind {
    /// Parses a plugin name from its config-file spelling.
    fn from_name(name: &str) -> Result<Self> {
        match name {
            "minimal" => Ok(Self::Minimal),
            "build" => Ok(Self::Build),
            "network" => Ok(Self::Network),
            "appcontainer" => Ok(Self::AppContainer),
            other => Err(Error::UnknownPlugin(other.to_owned())),
        }
    }
}

/// Capability flags handed to the Linux backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    /// Filesystem access inside the composed rootfs.
    pub const FILESYSTEM: Self = Self(0b0001);
    /// Spawning and signalling processes.
    pub const PROCESS_CONTROL: Self = Self(0b0010);
    /// SysV/POSIX IPC.
    pub const IPC: Self = Self(0b0100);
    /// Network namespace with a configured interface.
    pub const NETWORK: Self = Self(0b1000);

    /// Union of two flag sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every flag of `other` is present in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Overall security level derived from the plugin list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    /// Two or more relaxing plugins: widest grants.
    Default,
    /// Exactly one relaxing plugin.
    Restricted,
    /// Baseline only.
    Strict,
}

/// Windows process integrity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityLevel {
    /// Low integrity (sandboxed).
    Low,
    /// Medium integrity (standard user).
    Medium,
    /// High integrity (elevated).
    High,
    /// System integrity.
    System,
}

/// Windows isolation parameters derived from a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsIsolation {
    /// Whether to create/derive an AppContainer profile.
    pub use_appcontainer: bool,
    /// Integrity level applied in Strict mode.
    pub integrity_level: IntegrityLevel,
    /// Capability SIDs attached to the AppContainer, in SDDL form.
    pub capability_sids: Vec<String>,
}

/// Network hints that influence capability composition.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkHints {
    /// Caller supplied a container IP address.
    pub has_container_ip: bool,
    /// Caller supplied a container netmask.
    pub has_container_netmask: bool,
}

/// Internet client capability SID (AppContainer).
const SID_INTERNET_CLIENT: &str = "S-1-15-3-1";
/// Private network capability SID (AppContainer).
const SID_PRIVATE_NETWORK: &str = "S-1-15-3-3";

/// A composed container security policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Ordered plugin list; index 0 is always [`PluginKind::Minimal`].
    plugins: Vec<PluginKind>,
}

impl Policy {
    /// Composes a policy from an ordered plugin list.
    ///
    /// "minimal" is prepended when absent, so the baseline drop always
    /// runs first.
    pub fn new(plugins: Vec<PluginKind>) -> Self {
        let mut composed = Vec::with_capacity(plugins.len() + 1);
        composed.push(PluginKind::Minimal);
        composed.extend(plugins.into_iter().filter(|p| *p != PluginKind::Minimal));
        Self { plugins: composed }
    }

    /// Composes a policy from config-file plugin names plus custom paths.
    pub fn from_names(names: &[String], custom_paths: Vec<PathRule>) -> Result<Self> {
        let mut plugins = names
            .iter()
            .map(|n| PluginKind::from_name(n))
            .collect::<Result<Vec<_>>>()?;
        if !custom_paths.is_empty() {
            plugins.push(PluginKind::CustomPaths(custom_paths));
        }
        Ok(Self::new(plugins))
    }

    /// Ordered plugin list, baseline first.
    pub fn plugins(&self) -> &[PluginKind] {
        &self.plugins
    }

    /// Whether the policy contains the given plugin kind.
    pub fn has(&self, kind: &PluginKind) -> bool {
        self.plugins
            .iter()
            .any(|p| std::mem::discriminant(p) == std::mem::discriminant(kind))
    }

    /// All custom-path rules across the plugin list, in order.
    pub fn custom_paths(&self) -> impl Iterator<Item = &PathRule> {
        self.plugins.iter().flat_map(|p| match p {
            PluginKind::CustomPaths(rules) => rules.as_slice(),
            _ => &[],
        })
    }

    /// Builds the capability flag set for the Linux backend.
    ///
    /// Starts from filesystem + process control + IPC; network is added
    /// iff the policy carries the "network" plugin or the caller supplied
    /// both a container IP and netmask.
    pub fn capabilities(&self, net: NetworkHints) -> Capabilities {
        let mut caps = Capabilities::FILESYSTEM
            .union(Capabilities::PROCESS_CONTROL)
            .union(Capabilities::IPC);
        if self.has(&PluginKind::Network) || (net.has_container_ip && net.has_container_netmask) {
            caps = caps.union(Capabilities::NETWORK);
        }
        caps
    }

    /// Derives the overall security level.
    ///
    /// The baseline alone is Strict; each relaxing plugin (build, network,
    /// appcontainer, custom paths) moves the level one step toward Default.
    pub fn security_level(&self) -> SecurityLevel {
        let relaxing = self
            .plugins
            .iter()
            .filter(|p| !matches!(p, PluginKind::Minimal))
            .count();
        match relaxing {
            0 => SecurityLevel::Strict,
            1 => SecurityLevel::Restricted,
            _ => SecurityLevel::Default,
        }
    }

    /// Derives the Windows isolation parameters.
    ///
    /// AppContainer is used only when the "appcontainer" plugin is present;
    /// its capability SIDs track the network plugin.
    pub fn windows_isolation(&self) -> WindowsIsolation {
        let use_appcontainer = self.has(&PluginKind::AppContainer);
        let mut capability_sids = Vec::new();
        if use_appcontainer && self.has(&PluginKind::Network) {
            capability_sids.push(SID_INTERNET_CLIENT.to_owned());
            capability_sids.push(SID_PRIVATE_NETWORK.to_owned());
        }
        let integrity_level = match self.security_level() {
            SecurityLevel::Strict => IntegrityLevel::Low,
            SecurityLevel::Restricted => IntegrityLevel::Medium,
            SecurityLevel::Default => IntegrityLevel::Medium,
        };
        WindowsIsolation {
            use_appcontainer,
            integrity_level,
            capability_sids,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_is_always_first() {
        let p = Policy::new(vec![PluginKind::Build, PluginKind::Minimal]);
        assert_eq!(p.plugins()[0], PluginKind::Minimal);
        // The redundant "minimal" entry is dropped, not duplicated.
        assert_eq!(
            p.plugins()
                .iter()
                .filter(|k| **k == PluginKind::Minimal)
                .count(),
            1
        );
    }

    #[test]
    fn network_capability_from_plugin() {
        let p = Policy::from_names(&["network".into()], Vec::new()).unwrap();
        let caps = p.capabilities(NetworkHints::default());
        assert!(caps.contains(Capabilities::NETWORK));
    }

    #[test]
    fn network_capability_from_addressing() {
        let p = Policy::default();
        let hints = NetworkHints {
            has_container_ip: true,
            has_container_netmask: true,
        };
        assert!(p.capabilities(hints).contains(Capabilities::NETWORK));
        // IP without netmask is not enough.
        let partial = NetworkHints {
            has_container_ip: true,
            has_container_netmask: false,
        };
        assert!(!p.capabilities(partial).contains(Capabilities::NETWORK));
    }

    #[test]
    fn baseline_capabilities_always_present() {
        let caps = Policy::default().capabilities(NetworkHints::default());
        assert!(caps.contains(Capabilities::FILESYSTEM));
        assert!(caps.contains(Capabilities::PROCESS_CONTROL));
        assert!(caps.contains(Capabilities::IPC));
        assert!(!caps.contains(Capabilities::NETWORK));
    }

    #[test]
    fn security_level_tracks_plugin_count() {
        assert_eq!(Policy::default().security_level(), SecurityLevel::Strict);
        let one = Policy::from_names(&["build".into()], Vec::new()).unwrap();
        assert_eq!(one.security_level(), SecurityLevel::Restricted);
        let two = Policy::from_names(&["build".into(), "network".into()], Vec::new()).unwrap();
        assert_eq!(two.security_level(), SecurityLevel::Default);
    }

    #[test]
    fn appcontainer_suppressed_without_plugin() {
        let p = Policy::from_names(&["build".into(), "network".into()], Vec::new()).unwrap();
        let iso = p.windows_isolation();
        assert!(!iso.use_appcontainer);
        assert!(iso.capability_sids.is_empty());
    }

    #[test]
    fn appcontainer_network_gets_capability_sids() {
        let p = Policy::from_names(&["appcontainer".into(), "network".into()], Vec::new()).unwrap();
        let iso = p.windows_isolation();
        assert!(iso.use_appcontainer);
        assert_eq!(iso.capability_sids.len(), 2);
    }

    #[test]
    fn unknown_plugin_rejected() {
        assert!(Policy::from_names(&["root".into()], Vec::new()).is_err());
    }

    #[test]
    fn access_mask_roundtrip() {
        let m = AccessMask::parse("read,write,execute").unwrap();
        assert_eq!(m.render(), "read,write,execute");
        let r = AccessMask::parse("read").unwrap();
        assert!(r.contains(AccessMask::READ));
        assert!(!r.contains(AccessMask::WRITE));
    }
}
