//! Linux interpretation of a composed policy.
//!
//! Turns the platform-neutral [`Policy`] into the concrete enforcement
//! plan the Linux backend executes inside the new namespaces: a Linux
//! capability mask, a seccomp profile selection, and a bind-mount plan
//! for custom path grants.

use super::{AccessMask, Capabilities, NetworkHints, Policy, SecurityLevel};

/// Seccomp profile selected by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeccompProfile {
    /// Deny-default profile for Strict policies.
    Tight,
    /// Standard build profile: allows the common toolchain syscalls.
    Build,
}

/// One bind mount derived from a custom-path rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPlanEntry {
    /// Host source path.
    pub source: String,
    /// In-container target (same path).
    pub target: String,
    /// Mounted read-only when the rule grants no write access.
    pub readonly: bool,
}

/// Concrete Linux enforcement plan.
#[derive(Debug, Clone)]
pub struct LinuxPolicy {
    /// Engine capability flags (namespace selection).
    pub capabilities: Capabilities,
    /// Linux capabilities retained in the bounding set.
    pub retained_caps: Vec<libc::c_ulong>,
    /// Selected seccomp profile.
    pub seccomp: SeccompProfile,
    /// Bind mounts for custom path grants.
    pub binds: Vec<BindPlanEntry>,
}

// Capability numbers from `<linux/capability.h>`; libc exports no
// CAP_* constants because the kernel defines them as macros.
/// `CAP_CHOWN`.
pub const CAP_CHOWN: libc::c_ulong = 0;
/// `CAP_DAC_OVERRIDE`.
pub const CAP_DAC_OVERRIDE: libc::c_ulong = 1;
/// `CAP_FOWNER`.
pub const CAP_FOWNER: libc::c_ulong = 3;
/// `CAP_KILL`.
pub const CAP_KILL: libc::c_ulong = 5;
/// `CAP_SETGID`.
pub const CAP_SETGID: libc::c_ulong = 6;
/// `CAP_SETUID`.
pub const CAP_SETUID: libc::c_ulong = 7;
/// `CAP_NET_BIND_SERVICE`.
pub const CAP_NET_BIND_SERVICE: libc::c_ulong = 10;
/// `CAP_NET_ADMIN`.
pub const CAP_NET_ADMIN: libc::c_ulong = 12;
/// `CAP_NET_RAW`.
pub const CAP_NET_RAW: libc::c_ulong = 13;
/// `CAP_SYS_ADMIN`.
pub const CAP_SYS_ADMIN: libc::c_ulong = 21;

/// Capabilities retained by every policy: the minimum a PID-1 needs to
/// manage its children and mounts.
const BASE_CAPS: &[libc::c_ulong] = &[
    CAP_CHOWN,
    CAP_DAC_OVERRIDE,
    CAP_FOWNER,
    CAP_KILL,
    CAP_SETGID,
    CAP_SETUID,
    CAP_SYS_ADMIN,
];

/// Additional capabilities when the network flag is present.
const NET_CAPS: &[libc::c_ulong] = &[CAP_NET_ADMIN, CAP_NET_BIND_SERVICE, CAP_NET_RAW];

/// Builds the Linux enforcement plan for a policy.
pub fn interpret(policy: &Policy, net: NetworkHints) -> LinuxPolicy {
    let capabilities = policy.capabilities(net);

    let mut retained_caps = BASE_CAPS.to_vec();
    if capabilities.contains(Capabilities::NETWORK) {
        retained_caps.extend_from_slice(NET_CAPS);
    }

    let seccomp = match policy.security_level() {
        SecurityLevel::Strict => SeccompProfile::Tight,
        SecurityLevel::Restricted | SecurityLevel::Default => SeccompProfile::Build,
    };

    let binds = policy
        .custom_paths()
        .map(|rule| BindPlanEntry {
            source: rule.path.clone(),
            target: rule.path.clone(),
            readonly: !rule.access.contains(AccessMask::WRITE),
        })
        .collect();

    LinuxPolicy {
        capabilities,
        retained_caps,
        seccomp,
        binds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PathRule;

    #[test]
    fn strict_policy_selects_tight_seccomp() {
        let plan = interpret(&Policy::default(), NetworkHints::default());
        assert_eq!(plan.seccomp, SeccompProfile::Tight);
        assert!(!plan.retained_caps.contains(&CAP_NET_RAW));
    }

    #[test]
    fn network_policy_retains_net_caps() {
        let p = Policy::from_names(&["network".into()], Vec::new()).unwrap();
        let plan = interpret(&p, NetworkHints::default());
        assert!(plan.retained_caps.contains(&CAP_NET_RAW));
    }

    #[test]
    fn capability_numbers_match_the_kernel_header() {
        // linux/capability.h values; drift here silently changes the
        // bounding set.
        assert_eq!(CAP_CHOWN, 0);
        assert_eq!(CAP_DAC_OVERRIDE, 1);
        assert_eq!(CAP_FOWNER, 3);
        assert_eq!(CAP_KILL, 5);
        assert_eq!(CAP_SETGID, 6);
        assert_eq!(CAP_SETUID, 7);
        assert_eq!(CAP_NET_BIND_SERVICE, 10);
        assert_eq!(CAP_NET_ADMIN, 12);
        assert_eq!(CAP_NET_RAW, 13);
        assert_eq!(CAP_SYS_ADMIN, 21);
    }

    #[test]
    fn readonly_rule_binds_readonly() {
        let rules = vec![
            PathRule {
                path: "/opt/toolchain".into(),
                access: AccessMask::READ.union(AccessMask::EXEC),
            },
            PathRule {
                path: "/var/cache/chef".into(),
                access: AccessMask::READ.union(AccessMask::WRITE),
            },
        ];
        let p = Policy::from_names(&[], rules).unwrap();
        let plan = interpret(&p, NetworkHints::default());
        assert_eq!(plan.binds.len(), 2);
        assert!(plan.binds[0].readonly);
        assert!(!plan.binds[1].readonly);
    }
}
