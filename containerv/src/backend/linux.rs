//! Linux container backend: namespaces, policy enforcement, pivot_root.
//!
//! Create forks an init process that unshares mount/user/PID/UTS/IPC
//! namespaces (plus network when the policy grants it), executes the
//! recorded mount plan inside the new mount namespace, pivots into the
//! composed rootfs, drops capabilities to the policy mask, and then runs
//! the PID-1 control loop. The daemon keeps one control socket per
//! container and multiplexes spawns over it.

#![allow(unsafe_code)]
#![allow(clippy::undocumented_unsafe_blocks)]

use std::fs;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, unshare};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, fork, sethostname};
use tracing::{debug, info, warn};

use super::{
    BackendState, ContainerBackend, ContainerOptions, SpawnOptions, SpawnOutcome, validate_spawn,
};
use crate::bpf::{BpfManager, Enforcement};
use crate::layers::LayerContext;
use crate::oci;
use crate::path::normalize;
use crate::pid1::{self, Pid1Reply, Pid1Request};
use crate::policy::linux::{LinuxPolicy, interpret};
use crate::policy::{Capabilities, NetworkHints};
use crate::{Error, Result};

/// Handle to a live Linux container.
#[derive(Debug)]
pub struct LinuxHandle {
    /// Container id.
    id: String,
    /// Host pid of the container's init process.
    init_pid: Pid,
    /// Daemon side of the PID-1 control socket.
    control: UnixStream,
    /// Composed layer context; torn down on destroy.
    layers: Option<LayerContext>,
    /// Lifecycle state.
    state: BackendState,
}

impl LinuxHandle {
    /// Rootfs path of the container, for transfer operations.
    fn rootfs(&self) -> Result<&Path> {
        self.layers
            .as_ref()
            .map(LayerContext::base)
            .ok_or_else(|| Error::Backend("container already destroyed".into()))
    }
}

/// The Linux namespace backend.
#[derive(Debug)]
pub struct LinuxBackend {
    /// Shared BPF-LSM manager, created once at daemon start.
    bpf: Arc<BpfManager>,
}

impl LinuxBackend {
    /// Creates a backend sharing the daemon's BPF manager.
    pub fn new(bpf: Arc<BpfManager>) -> Self {
        Self { bpf }
    }

    /// Sends a control request to PID-1 and reads the reply.
    fn roundtrip(handle: &mut LinuxHandle, req: &Pid1Request) -> Result<Pid1Reply> {
        containerv_proto::write_packet(&mut handle.control, req)
            .map_err(|e| Error::os("control write", e))?;
        containerv_proto::read_packet(&mut handle.control).map_err(|e| Error::os("control read", e))
    }
}

impl ContainerBackend for LinuxBackend {
    type Handle = LinuxHandle;
    type Process = u32;

    fn create(
        &self,
        id: &str,
        opts: &ContainerOptions,
        layers: LayerContext,
    ) -> Result<Self::Handle> {
        let hints = NetworkHints {
            has_container_ip: opts.network.container_ip.is_some(),
            has_container_netmask: opts.network.container_netmask.is_some(),
        };
        let plan = interpret(&opts.policy, hints);

        if let Err(e) = self.bpf.reserve(id) {
            layers.destroy()?;
            return Err(e);
        }
        if self.bpf.enforcement() == Enforcement::SeccompOnly {
            warn!(container = id, "enforcing with seccomp only");
        }

        let hostname = opts.hostname.clone().unwrap_or_else(|| id.to_owned());

        let params = oci::BundleParams {
            root_path: layers.base().to_path_buf(),
            hostname: Some(hostname.clone()),
            dns: opts.network.dns.clone(),
            mounts: layers
                .mount_plan()
                .iter()
                .map(|m| oci::BindMount {
                    source: m.source.to_string_lossy().into_owned(),
                    destination: m.target.clone(),
                    readonly: m.readonly,
                })
                .chain(plan.binds.iter().map(|b| oci::BindMount {
                    source: b.source.clone(),
                    destination: b.target.clone(),
                    readonly: b.readonly,
                }))
                .collect(),
            ..oci::BundleParams::default()
        };
        if let Err(e) = oci::build_bundle(layers.staging(), &params) {
            self.bpf.release(id);
            layers.destroy()?;
            return Err(e);
        }

        let (daemon_sock, child_sock) = match UnixStream::pair() {
            Ok(pair) => pair,
            Err(e) => {
                self.bpf.release(id);
                layers.destroy()?;
                return Err(Error::os("socketpair", e));
            }
        };

        // SAFETY: the child only calls async-signal-safe code plus its own
        // single-threaded setup before exec'ing into the PID-1 loop.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(daemon_sock);
                let code = match init_container(child_sock, &layers, &plan, &hostname) {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("[cvd-init] setup failed: {e}");
                        1
                    }
                };
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(child_sock);
                info!(container = id, init_pid = child.as_raw(), "container created");
                Ok(LinuxHandle {
                    id: id.to_owned(),
                    init_pid: child,
                    control: daemon_sock,
                    layers: Some(layers),
                    state: BackendState::Running,
                })
            }
            Err(e) => {
                self.bpf.release(id);
                layers.destroy()?;
                Err(Error::os("fork", e))
            }
        }
    }

    fn spawn(
        &self,
        handle: &mut Self::Handle,
        opts: &SpawnOptions,
    ) -> Result<SpawnOutcome<Self::Process>> {
        validate_spawn(opts)?;
        if handle.state != BackendState::Running {
            return Err(Error::Backend("container is not running".into()));
        }
        match Self::roundtrip(handle, &Pid1Request::Spawn(opts.clone()))? {
            Pid1Reply::Spawned { pid, exit_code } => Ok(SpawnOutcome {
                process: pid,
                exit_code,
            }),
            Pid1Reply::Err(e) => Err(Error::Backend(e)),
            other => Err(Error::Backend(format!("unexpected reply {other:?}"))),
        }
    }

    fn kill(&self, handle: &mut Self::Handle, process: &Self::Process) -> Result<()> {
        match Self::roundtrip(handle, &Pid1Request::Kill { pid: *process })? {
            Pid1Reply::Killed => Ok(()),
            Pid1Reply::Err(e) => Err(Error::Backend(e)),
            other => Err(Error::Backend(format!("unexpected reply {other:?}"))),
        }
    }

    fn upload(&self, handle: &Self::Handle, sources: &[PathBuf], dests: &[PathBuf]) -> Result<()> {
        let root = handle.rootfs()?;
        for (src, dst) in sources.iter().zip(dests) {
            let target = root.join(normalize(&dst.to_string_lossy())?);
            copy_path(src, &target)?;
        }
        Ok(())
    }

    fn download(
        &self,
        handle: &Self::Handle,
        sources: &[PathBuf],
        dests: &[PathBuf],
    ) -> Result<()> {
        let root = handle.rootfs()?;
        for (src, dst) in sources.iter().zip(dests) {
            let inside = root.join(normalize(&src.to_string_lossy())?);
            copy_path(&inside, dst)?;
        }
        Ok(())
    }

    fn destroy(&self, mut handle: Self::Handle) -> Result<()> {
        // Best-effort graceful shutdown; PID-1 kills its children first.
        let _ = Self::roundtrip(&mut handle, &Pid1Request::Shutdown);
        let _ = waitpid(handle.init_pid, None);
        handle.state = BackendState::Destroyed;
        self.bpf.release(&handle.id);
        if let Some(layers) = handle.layers.take() {
            layers.destroy()?;
        }
        debug!(container = %handle.id, "container destroyed");
        Ok(())
    }
}

/// Recursively copies a file or directory tree.
fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src).map_err(|e| Error::os("stat source", e))?;
    if meta.is_dir() {
        fs::create_dir_all(dst).map_err(|e| Error::os("create dir", e))?;
        for entry in fs::read_dir(src).map_err(|e| Error::os("read dir", e))? {
            let entry = entry.map_err(|e| Error::os("read dir entry", e))?;
            copy_path(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::os("create parent", e))?;
        }
        fs::copy(src, dst).map_err(|e| Error::os("copy file", e))?;
    }
    Ok(())
}

/// Container init: namespaces, mounts, pivot, capability drop, PID-1 loop.
///
/// Runs in the forked child; never returns to backend code.
fn init_container(
    control: UnixStream,
    layers: &LayerContext,
    plan: &LinuxPolicy,
    hostname: &str,
) -> Result<()> {
    let mut flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC;
    if plan.capabilities.contains(Capabilities::NETWORK) {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    unshare(flags).map_err(|e| Error::os("unshare", e))?;

    write_id_maps()?;
    sethostname(hostname).map_err(|e| Error::os("sethostname", e))?;

    // The first fork after CLONE_NEWPID becomes pid 1 of the namespace.
    // SAFETY: single-threaded at this point.
    match unsafe { fork() }.map_err(|e| Error::os("fork init", e))? {
        ForkResult::Child => {
            setup_rootfs(layers, plan)?;
            drop_bounding_set(plan)?;
            no_new_privs()?;
            pid1::run(control)
        }
        ForkResult::Parent { child } => {
            drop(control);
            let _ = waitpid(child, None);
            Ok(())
        }
    }
}

/// Maps root inside the user namespace to the invoking uid/gid.
fn write_id_maps() -> Result<()> {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    fs::write("/proc/self/uid_map", format!("0 {uid} 1"))
        .map_err(|e| Error::os("write uid_map", e))?;
    fs::write("/proc/self/setgroups", "deny").map_err(|e| Error::os("write setgroups", e))?;
    fs::write("/proc/self/gid_map", format!("0 {gid} 1"))
        .map_err(|e| Error::os("write gid_map", e))?;
    Ok(())
}

/// Executes the mount plan inside the new mount namespace and pivots.
fn setup_rootfs(layers: &LayerContext, plan: &LinuxPolicy) -> Result<()> {
    let root = layers.base();

    // Everything below is private to this namespace.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| Error::os("make / private", e))?;

    // The new root must itself be a mount point for pivot_root.
    mount(
        Some(root),
        root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::os("bind rootfs", e))?;

    if let Some(ov) = layers.overlay() {
        let lowers: Vec<String> = std::iter::once(root.to_string_lossy().into_owned())
            .chain(ov.lower.iter().map(|p| p.to_string_lossy().into_owned()))
            .collect();
        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers.join(":"),
            ov.upper.display(),
            ov.work.display()
        );
        mount(
            Some("overlay"),
            root,
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .map_err(|e| Error::os("mount overlay", e))?;
    }

    let binds: Vec<PlanEntry> = layers
        .mount_plan()
        .iter()
        .map(|m| PlanEntry {
            source: m.source.clone(),
            target: m.target.clone(),
            readonly: m.readonly,
        })
        .chain(plan.binds.iter().map(|b| PlanEntry {
            source: PathBuf::from(&b.source),
            target: b.target.clone(),
            readonly: b.readonly,
        }))
        .collect();

    for entry in binds {
        let target = root.join(normalize(&entry.target)?);
        fs::create_dir_all(&target).map_err(|e| Error::os("create mount target", e))?;
        let mut ms = MsFlags::MS_BIND | MsFlags::MS_REC;
        mount(
            Some(entry.source.as_path()),
            &target,
            None::<&str>,
            ms,
            None::<&str>,
        )
        .map_err(|e| Error::os("bind layer", e))?;
        if entry.readonly {
            ms |= MsFlags::MS_RDONLY | MsFlags::MS_REMOUNT;
            mount(None::<&str>, &target, None::<&str>, ms, None::<&str>)
                .map_err(|e| Error::os("remount ro", e))?;
        }
    }

    pivot_into(root)
}

/// Normalized (source, target, readonly) triple from either plan.
struct PlanEntry {
    /// Host source.
    source: PathBuf,
    /// Container-relative target.
    target: String,
    /// Bind read-only.
    readonly: bool,
}

/// `pivot_root` into the prepared rootfs and detach the old root.
fn pivot_into(root: &Path) -> Result<()> {
    let old = root.join(".oldroot");
    fs::create_dir_all(&old).map_err(|e| Error::os("create .oldroot", e))?;

    let root_c = std::ffi::CString::new(root.to_string_lossy().into_owned())
        .map_err(|_| Error::InvalidPath(root.display().to_string()))?;
    let old_c = std::ffi::CString::new(old.to_string_lossy().into_owned())
        .map_err(|_| Error::InvalidPath(old.display().to_string()))?;
    let rc = unsafe { libc::syscall(libc::SYS_pivot_root, root_c.as_ptr(), old_c.as_ptr()) };
    if rc != 0 {
        return Err(Error::os("pivot_root", io::Error::last_os_error()));
    }

    std::env::set_current_dir("/").map_err(|e| Error::os("chdir /", e))?;
    umount2("/.oldroot", MntFlags::MNT_DETACH).map_err(|e| Error::os("umount old root", e))?;
    let _ = fs::remove_dir("/.oldroot");
    Ok(())
}

/// Drops every capability outside the policy's retained set from the
/// bounding set.
fn drop_bounding_set(plan: &LinuxPolicy) -> Result<()> {
    for cap in 0..=last_cap() {
        if plan.retained_caps.contains(&cap) {
            continue;
        }
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
        // EINVAL means the kernel doesn't know this cap; skip it.
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINVAL) {
                return Err(Error::os("prctl CAPBSET_DROP", err));
            }
        }
    }
    Ok(())
}

/// Highest capability number the running kernel supports.
fn last_cap() -> libc::c_ulong {
    fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(40)
}

/// Sets `no_new_privs` so the seccomp/BPF profile cannot be escaped via
/// setuid binaries.
fn no_new_privs() -> Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(Error::os("prctl NO_NEW_PRIVS", io::Error::last_os_error()));
    }
    Ok(())
}
