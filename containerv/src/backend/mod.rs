//! Per-OS container backends.
//!
//! The daemon's registry drives containers through the
//! [`ContainerBackend`] trait; the Linux backend builds namespace
//! containers, the Windows backend speaks HCS. Tests substitute an
//! in-memory backend, so nothing above this seam needs root.

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(windows)]
pub mod windows;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::layers::LayerContext;
use crate::policy::Policy;
use crate::{Error, Result};

/// Externally driven container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Backend handle exists; nothing is running yet.
    Created,
    /// PID-1 is up and accepting spawns.
    Running,
    /// Torn down; the handle is dead.
    Destroyed,
}

/// Network configuration for a container.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    /// Address assigned to the container interface.
    pub container_ip: Option<String>,
    /// Netmask for the container interface.
    pub container_netmask: Option<String>,
    /// Host-side address of the veth pair.
    pub host_ip: Option<String>,
    /// Default gateway inside the container.
    pub gateway_ip: Option<String>,
    /// DNS servers, separated by `,`, `;`, or whitespace.
    pub dns: Option<String>,
}

/// Validated parameter bundle for container creation.
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    /// Container hostname.
    pub hostname: Option<String>,
    /// Composed security policy.
    pub policy: Policy,
    /// Network configuration.
    pub network: NetworkConfig,
    /// Windows guest parameters; ignored by the Linux backend.
    pub guest_windows: Option<containerv_proto::WindowsGuest>,
}

/// Options for one spawn inside a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Argument vector; `argv[0]` is the executable.
    pub argv: Vec<String>,
    /// Flat `KEY=VALUE` environment, passed through unmodified.
    pub env: Vec<String>,
    /// Block until the child exits and return its exit code.
    pub wait: bool,
    /// CPU share limit in percent, at most 100.
    pub cpu_percent: Option<u8>,
}

/// Validates spawn options before any process work.
pub fn validate_spawn(opts: &SpawnOptions) -> Result<()> {
    let argv0 = opts
        .argv
        .first()
        .ok_or_else(|| Error::InvalidSpawn("argv[0] missing".into()))?;
    if argv0.is_empty() {
        return Err(Error::InvalidSpawn("command is empty".into()));
    }
    if let Some(pct) = opts.cpu_percent
        && pct > 100
    {
        return Err(Error::InvalidSpawn(format!("cpu_percent {pct} > 100")));
    }
    Ok(())
}

/// Result of a spawn: the backend process handle, plus the exit code when
/// the spawn waited for completion.
#[derive(Debug)]
pub struct SpawnOutcome<P> {
    /// Opaque backend process handle.
    pub process: P,
    /// Exit code, present iff `wait` was set.
    pub exit_code: Option<i32>,
}

/// The seam between the daemon registry and an OS container engine.
pub trait ContainerBackend {
    /// Opaque per-container handle.
    type Handle: fmt::Debug;
    /// Opaque per-process handle (a pid on Linux, a HANDLE on Windows).
    type Process: fmt::Debug + Clone + PartialEq;

    /// Creates a container from a composed layer context.
    ///
    /// On failure the layer context must already be torn down; the caller
    /// never sees a half-created handle.
    fn create(
        &self,
        id: &str,
        opts: &ContainerOptions,
        layers: LayerContext,
    ) -> Result<Self::Handle>;

    /// Spawns a process inside the container.
    fn spawn(
        &self,
        handle: &mut Self::Handle,
        opts: &SpawnOptions,
    ) -> Result<SpawnOutcome<Self::Process>>;

    /// Kills a previously spawned process.
    fn kill(&self, handle: &mut Self::Handle, process: &Self::Process) -> Result<()>;

    /// Copies host paths into the container, pairwise.
    fn upload(&self, handle: &Self::Handle, sources: &[PathBuf], dests: &[PathBuf]) -> Result<()>;

    /// Copies container paths out to the host, pairwise.
    fn download(&self, handle: &Self::Handle, sources: &[PathBuf], dests: &[PathBuf])
    -> Result<()>;

    /// Tears the container down: no process survives this call.
    fn destroy(&self, handle: Self::Handle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_bad_options() {
        assert!(validate_spawn(&SpawnOptions::default()).is_err());
        let mut o = SpawnOptions {
            argv: vec![String::new()],
            ..SpawnOptions::default()
        };
        assert!(validate_spawn(&o).is_err());
        o.argv = vec!["/bin/true".into()];
        o.cpu_percent = Some(101);
        assert!(validate_spawn(&o).is_err());
        o.cpu_percent = Some(100);
        assert!(validate_spawn(&o).is_ok());
    }
}
