//! Windows container backend over the Host Compute Service (HCS).
//!
//! Supports both flavors: WCOW (parent-layer based) and LCOW (Linux
//! guest inside a utility VM booted via `HvRuntime`). Create composes
//! the rootfs, builds a schema1 compute-system document, and drives
//! `HcsCreateComputeSystem`/`HcsStartComputeSystem` through a blocking
//! operation. Process creation always goes through the secure sequence:
//! policy token, capability SIDs, attribute list of one entry,
//! `CreateProcessAsUserW` with a suspended primary thread. Every PID-1
//! manager owns a Job Object configured to kill its contents when the
//! handle closes.

#![allow(unsafe_code)]
#![allow(clippy::undocumented_unsafe_blocks)]

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, HLOCAL, LocalFree};
use windows_sys::Win32::Security::Authorization::ConvertStringSidToSidW;
use windows_sys::Win32::Security::{PSID, SE_GROUP_ENABLED, SECURITY_CAPABILITIES, SID_AND_ATTRIBUTES};
use windows_sys::Win32::System::HostComputeSystem::{
    HCS_OPERATION, HCS_SYSTEM, HcsCloseComputeSystem, HcsCloseOperation, HcsCreateComputeSystem,
    HcsCreateOperation, HcsStartComputeSystem, HcsTerminateComputeSystem,
    HcsWaitForOperationResult,
};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JobObjectExtendedLimitInformation,
    SetInformationJobObject, TerminateJobObject,
};
use windows_sys::Win32::System::Threading::{
    CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, CreateProcessAsUserW,
    DeleteProcThreadAttributeList, EXTENDED_STARTUPINFO_PRESENT, InitializeProcThreadAttributeList,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROC_THREAD_ATTRIBUTE_SECURITY_CAPABILITIES, PROCESS_INFORMATION,
    ResumeThread, STARTUPINFOEXW, TerminateProcess, UpdateProcThreadAttribute,
};
use windows_sys::core::PWSTR;

use super::{
    BackendState, ContainerBackend, ContainerOptions, SpawnOptions, SpawnOutcome, validate_spawn,
};
use crate::layers::{self, LayerContext};
use crate::path::normalize;
use crate::policy::windows::{TokenCtx, apply};
use crate::{Error, Result};

/// How long a single HCS operation may block, in milliseconds.
const HCS_OPERATION_TIMEOUT_MS: u32 = 240_000;

/// Windows guest flavor plus its boot parameters.
#[derive(Debug, Clone, Default)]
pub struct GuestConfig {
    /// LCOW or WCOW.
    pub lcow: bool,
    /// UVM image path; required for LCOW.
    pub uvm_image: Option<PathBuf>,
    /// Kernel path override (LCOW).
    pub kernel: Option<PathBuf>,
    /// Initrd path override (LCOW).
    pub initrd: Option<PathBuf>,
    /// Kernel boot parameters (LCOW).
    pub boot_params: Option<String>,
    /// WCOW parent layers, newline-flattened.
    pub parent_layers: Option<String>,
}

impl GuestConfig {
    /// Builds a config from wire-level guest parameters.
    pub fn from_wire(wire: &containerv_proto::WindowsGuest) -> Self {
        Self {
            lcow: wire.guest_type == containerv_proto::GuestType::Lcow,
            uvm_image: wire.uvm_image.as_deref().map(PathBuf::from),
            kernel: wire.kernel.as_deref().map(PathBuf::from),
            initrd: wire.initrd.as_deref().map(PathBuf::from),
            boot_params: wire.boot_params.clone(),
            parent_layers: wire.parent_layers.clone(),
        }
    }

    /// Unflattens the newline-delimited WCOW parent-layer string.
    pub fn parent_layer_list(&self) -> Vec<String> {
        self.parent_layers
            .as_deref()
            .map(|s| {
                s.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }
}

// --- schema1 compute-system document --------------------------------------

/// Top-level schema1 document handed to `HcsCreateComputeSystem`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ComputeSystemDoc {
    /// Always `"Container"`.
    system_type: &'static str,
    /// Container name; the container id.
    name: String,
    /// Owner tag HCS reports in enumeration.
    owner: &'static str,
    /// Scratch/rootfs folder.
    layer_folder_path: String,
    /// Read-only parent layers (WCOW).
    layers: Vec<LayerRef>,
    /// True for UVM-backed (LCOW) containers.
    hv_partition: bool,
    /// UVM boot configuration, present iff `hv_partition`.
    #[serde(skip_serializing_if = "Option::is_none")]
    hv_runtime: Option<HvRuntime>,
    /// `"linux"` for LCOW, absent for WCOW.
    #[serde(skip_serializing_if = "Option::is_none")]
    container_type: Option<&'static str>,
    /// Tear the container down with the last open handle.
    terminate_on_last_handle_closed: bool,
}

/// One parent layer reference.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LayerRef {
    /// Layer identity.
    id: String,
    /// Layer folder.
    path: String,
}

/// UVM boot parameters for LCOW.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HvRuntime {
    /// UVM image directory.
    image_path: String,
    /// Kernel file override.
    #[serde(skip_serializing_if = "Option::is_none")]
    linux_kernel_file: Option<String>,
    /// Initrd file override.
    #[serde(skip_serializing_if = "Option::is_none")]
    linux_initrd_file: Option<String>,
    /// Kernel command-line override.
    #[serde(skip_serializing_if = "Option::is_none")]
    linux_boot_parameters: Option<String>,
}

/// Builds the schema1 JSON document for one container.
fn schema1_document(guest: &GuestConfig, id: &str, rootfs: &Path) -> Result<String> {
    let (hv_runtime, container_type) = if guest.lcow {
        let image = guest
            .uvm_image
            .as_ref()
            .ok_or_else(|| Error::Backend("LCOW requires a UVM image path".into()))?;
        (
            Some(HvRuntime {
                image_path: image.to_string_lossy().into_owned(),
                linux_kernel_file: guest.kernel.as_ref().map(|p| p.to_string_lossy().into_owned()),
                linux_initrd_file: guest.initrd.as_ref().map(|p| p.to_string_lossy().into_owned()),
                linux_boot_parameters: guest.boot_params.clone(),
            }),
            Some("linux"),
        )
    } else {
        (None, None)
    };

    let layers = guest
        .parent_layer_list()
        .into_iter()
        .enumerate()
        .map(|(i, path)| LayerRef {
            id: format!("layer-{i}"),
            path,
        })
        .collect();

    let doc = ComputeSystemDoc {
        system_type: "Container",
        name: id.to_owned(),
        owner: "cvd",
        layer_folder_path: rootfs.to_string_lossy().into_owned(),
        layers,
        hv_partition: guest.lcow,
        hv_runtime,
        container_type,
        terminate_on_last_handle_closed: true,
    };
    Ok(serde_json::to_string(&doc)?)
}

/// Handle to a live HCS container.
#[derive(Debug)]
pub struct HcsHandle {
    /// Container id.
    id: String,
    /// The compute system.
    system: HCS_SYSTEM,
    /// Job Object tracking every spawned process.
    job: HANDLE,
    /// Policy token context; dropped last.
    token: TokenCtx,
    /// Composed layer context.
    layers: Option<LayerContext>,
    /// Lifecycle state.
    state: BackendState,
}

// SAFETY: the raw handles are owned exclusively by this struct.
unsafe impl Send for HcsHandle {}

impl Drop for HcsHandle {
    fn drop(&mut self) {
        if !self.job.is_null() {
            // KILL_ON_JOB_CLOSE terminates every contained process.
            unsafe { CloseHandle(self.job) };
            self.job = std::ptr::null_mut();
        }
        if !self.system.is_null() {
            // terminate_on_last_handle_closed tears the guest down.
            unsafe { HcsCloseComputeSystem(self.system) };
            self.system = std::ptr::null_mut();
        }
    }
}

/// The HCS backend.
#[derive(Debug)]
pub struct HcsBackend {
    /// Guest configuration applied to every create.
    guest: GuestConfig,
}

impl HcsBackend {
    /// Creates a backend for the given guest flavor.
    pub fn new(guest: GuestConfig) -> Result<Self> {
        if guest.lcow && guest.uvm_image.is_none() {
            return Err(Error::Backend("LCOW requires a UVM image path".into()));
        }
        Ok(Self { guest })
    }
}

impl ContainerBackend for HcsBackend {
    type Handle = HcsHandle;
    type Process = isize;

    fn create(
        &self,
        id: &str,
        opts: &ContainerOptions,
        layer_ctx: LayerContext,
    ) -> Result<Self::Handle> {
        let guest = match &opts.guest_windows {
            Some(wire) => GuestConfig::from_wire(wire),
            None => self.guest.clone(),
        };
        if guest.lcow && guest.uvm_image.is_none() {
            layer_ctx.destroy()?;
            return Err(Error::Backend("LCOW requires a UVM image path".into()));
        }

        // HCS has no host-side mount plan; directory layers are copied
        // into the composed rootfs, later layers overwriting earlier.
        let hostname = opts.hostname.as_deref().unwrap_or(id);
        let populate = crate::oci::prepare_rootfs(
            layer_ctx.base(),
            Some(hostname),
            opts.network.dns.as_deref(),
        )
        .and_then(|()| {
            for entry in layer_ctx.mount_plan() {
                let target = layer_ctx.base().join(normalize(&entry.target)?);
                copy_tree(&entry.source, &target)?;
            }
            Ok(())
        });
        if let Err(e) = populate {
            layer_ctx.destroy()?;
            return Err(e);
        }

        let token = match apply(&opts.policy, id) {
            Ok(t) => t,
            Err(e) => {
                layer_ctx.destroy()?;
                return Err(e);
            }
        };

        let document = match schema1_document(&guest, id, layer_ctx.base()) {
            Ok(d) => d,
            Err(e) => {
                layer_ctx.destroy()?;
                return Err(e);
            }
        };
        let system = match create_compute_system(id, &document) {
            Ok(s) => s,
            Err(e) => {
                layer_ctx.destroy()?;
                return Err(e);
            }
        };

        let job = unsafe { CreateJobObjectW(std::ptr::null(), std::ptr::null()) };
        if job.is_null() {
            let err = io::Error::last_os_error();
            unsafe { HcsCloseComputeSystem(system) };
            layer_ctx.destroy()?;
            return Err(Error::os("CreateJobObjectW", err));
        }

        let mut limits: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
        limits.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        let ok = unsafe {
            SetInformationJobObject(
                job,
                JobObjectExtendedLimitInformation,
                std::ptr::addr_of!(limits).cast(),
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            unsafe {
                CloseHandle(job);
                HcsCloseComputeSystem(system);
            }
            layer_ctx.destroy()?;
            return Err(Error::os("SetInformationJobObject", err));
        }

        if !guest.lcow {
            let parents = guest.parent_layer_list();
            debug!(container = id, parents = parents.len(), "WCOW parent layers");
        }

        info!(container = id, lcow = guest.lcow, "HCS container created");
        Ok(HcsHandle {
            id: id.to_owned(),
            system,
            job,
            token,
            layers: Some(layer_ctx),
            state: BackendState::Running,
        })
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

        let info = secure_spawn(handle, opts)?;
        let ok = unsafe { AssignProcessToJobObject(handle.job, info.hProcess) };
        if ok == 0 {
            let err = io::Error::last_os_error();
            unsafe {
                TerminateProcess(info.hProcess, 1);
                CloseHandle(info.hThread);
                CloseHandle(info.hProcess);
            }
            return Err(Error::os("AssignProcessToJobObject", err));
        }
        unsafe {
            ResumeThread(info.hThread);
            CloseHandle(info.hThread);
        }

        let exit_code = if opts.wait {
            Some(wait_process(info.hProcess)?)
        } else {
            None
        };
        Ok(SpawnOutcome {
            process: info.hProcess as isize,
            exit_code,
        })
    }

    fn kill(&self, _handle: &mut Self::Handle, process: &Self::Process) -> Result<()> {
        let h = *process as HANDLE;
        let ok = unsafe { TerminateProcess(h, 1) };
        if ok == 0 {
            return Err(Error::os("TerminateProcess", io::Error::last_os_error()));
        }
        unsafe { CloseHandle(h) };
        Ok(())
    }

    fn upload(&self, handle: &Self::Handle, sources: &[PathBuf], dests: &[PathBuf]) -> Result<()> {
        let root = handle_rootfs(handle)?;
        for (src, dst) in sources.iter().zip(dests) {
            let target = root.join(normalize(&dst.to_string_lossy())?);
            copy_tree(src, &target)?;
        }
        Ok(())
    }

    fn download(
        &self,
        handle: &Self::Handle,
        sources: &[PathBuf],
        dests: &[PathBuf],
    ) -> Result<()> {
        let root = handle_rootfs(handle)?;
        for (src, dst) in sources.iter().zip(dests) {
            let inside = root.join(normalize(&src.to_string_lossy())?);
            copy_tree(&inside, dst)?;
        }
        Ok(())
    }

    fn destroy(&self, mut handle: Self::Handle) -> Result<()> {
        if !handle.system.is_null() {
            terminate_compute_system(handle.system);
            unsafe { HcsCloseComputeSystem(handle.system) };
            handle.system = std::ptr::null_mut();
        }
        unsafe { TerminateJobObject(handle.job, 0) };
        handle.state = BackendState::Destroyed;
        if let Some(layer_ctx) = handle.layers.take() {
            layer_ctx.destroy()?;
        }
        debug!(container = %handle.id, "container destroyed");
        Ok(())
    }
}

/// Encodes a Rust string as a NUL-terminated UTF-16 buffer.
fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Waits for the pending work on `operation` and frees its result
/// document.
fn hcs_wait(op_name: &'static str, operation: HCS_OPERATION) -> Result<()> {
    let mut result_doc: PWSTR = std::ptr::null_mut();
    let hr =
        unsafe { HcsWaitForOperationResult(operation, HCS_OPERATION_TIMEOUT_MS, &mut result_doc) };
    if !result_doc.is_null() {
        unsafe { LocalFree(result_doc as HLOCAL) };
    }
    if hr < 0 {
        return Err(Error::os(op_name, io::Error::from_raw_os_error(hr)));
    }
    Ok(())
}

/// Creates and starts the compute system described by `document`.
fn create_compute_system(id: &str, document: &str) -> Result<HCS_SYSTEM> {
    let wide_id = wide(id);
    let wide_doc = wide(document);

    let operation = unsafe { HcsCreateOperation(std::ptr::null(), None) };
    if operation.is_null() {
        return Err(Error::os("HcsCreateOperation", io::Error::last_os_error()));
    }

    let mut system: HCS_SYSTEM = std::ptr::null_mut();
    let hr = unsafe {
        HcsCreateComputeSystem(
            wide_id.as_ptr(),
            wide_doc.as_ptr(),
            operation,
            std::ptr::null(),
            &mut system,
        )
    };
    let result = if hr < 0 {
        Err(Error::os(
            "HcsCreateComputeSystem",
            io::Error::from_raw_os_error(hr),
        ))
    } else {
        hcs_wait("HcsCreateComputeSystem", operation)
    };

    let result = result.and_then(|()| {
        let hr = unsafe { HcsStartComputeSystem(system, operation, std::ptr::null()) };
        if hr < 0 {
            Err(Error::os(
                "HcsStartComputeSystem",
                io::Error::from_raw_os_error(hr),
            ))
        } else {
            hcs_wait("HcsStartComputeSystem", operation)
        }
    });

    unsafe { HcsCloseOperation(operation) };
    match result {
        Ok(()) => Ok(system),
        Err(e) => {
            if !system.is_null() {
                unsafe { HcsCloseComputeSystem(system) };
            }
            Err(e)
        }
    }
}

/// Best-effort graceful termination of a compute system.
fn terminate_compute_system(system: HCS_SYSTEM) {
    let operation = unsafe { HcsCreateOperation(std::ptr::null(), None) };
    if operation.is_null() {
        return;
    }
    let hr = unsafe { HcsTerminateComputeSystem(system, operation, std::ptr::null()) };
    if hr >= 0 {
        let _ = hcs_wait("HcsTerminateComputeSystem", operation);
    }
    unsafe { HcsCloseOperation(operation) };
}

/// Rootfs of a live handle.
fn handle_rootfs(handle: &HcsHandle) -> Result<&Path> {
    handle
        .layers
        .as_ref()
        .map(LayerContext::base)
        .ok_or_else(|| Error::Backend("container already destroyed".into()))
}

/// Best-effort recursive copy, re-creating symlinks where possible.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(src).map_err(|e| Error::os("stat source", e))?;
    if meta.is_dir() {
        std::fs::create_dir_all(dst).map_err(|e| Error::os("create dir", e))?;
        for entry in std::fs::read_dir(src).map_err(|e| Error::os("read dir", e))? {
            let entry = entry.map_err(|e| Error::os("read dir entry", e))?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else if meta.is_symlink() {
        if let Ok(link) = std::fs::read_link(src) {
            let _ = std::os::windows::fs::symlink_file(&link, dst);
        }
    } else {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::os("create parent", e))?;
        }
        std::fs::copy(src, dst).map_err(|e| Error::os("copy file", e))?;
    }
    Ok(())
}

/// Encodes a command line and environment block as UTF-16.
fn encode_command(opts: &SpawnOptions) -> (Vec<u16>, Vec<u16>) {
    let cmdline: Vec<u16> = opts
        .argv
        .join(" ")
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();
    let mut env: Vec<u16> = Vec::new();
    for pair in &opts.env {
        env.extend(pair.encode_utf16());
        env.push(0);
    }
    env.push(0);
    (cmdline, env)
}

/// Converts the policy's SDDL capability strings into an attribute
/// array for `SECURITY_CAPABILITIES`.
///
/// Each returned SID is LocalAlloc'd; release with
/// [`free_capability_sids`].
fn capability_attributes(sddl: &[String]) -> Result<Vec<SID_AND_ATTRIBUTES>> {
    let mut attrs = Vec::with_capacity(sddl.len());
    for cap in sddl {
        let text = wide(cap);
        let mut sid: PSID = std::ptr::null_mut();
        if unsafe { ConvertStringSidToSidW(text.as_ptr(), &mut sid) } == 0 {
            let err = io::Error::last_os_error();
            free_capability_sids(&attrs);
            return Err(Error::os("ConvertStringSidToSidW", err));
        }
        attrs.push(SID_AND_ATTRIBUTES {
            Sid: sid,
            Attributes: SE_GROUP_ENABLED,
        });
    }
    Ok(attrs)
}

/// Frees SIDs produced by [`capability_attributes`].
fn free_capability_sids(attrs: &[SID_AND_ATTRIBUTES]) {
    for attr in attrs {
        if !attr.Sid.is_null() {
            unsafe { LocalFree(attr.Sid as HLOCAL) };
        }
    }
}

/// The secure process creation sequence.
///
/// On failure, SIDs and the attribute list are freed in reverse order of
/// acquisition; nothing leaks past this function.
fn secure_spawn(handle: &HcsHandle, opts: &SpawnOptions) -> Result<PROCESS_INFORMATION> {
    let (mut cmdline, mut env) = encode_command(opts);

    let mut startup: STARTUPINFOEXW = unsafe { std::mem::zeroed() };
    startup.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;

    let mut attr_buf: Vec<u8> = Vec::new();
    let mut caps: SECURITY_CAPABILITIES = unsafe { std::mem::zeroed() };
    let mut cap_attrs: Vec<SID_AND_ATTRIBUTES> = Vec::new();

    let use_appcontainer = !handle.token.appcontainer_sid().is_null();
    if use_appcontainer {
        cap_attrs = capability_attributes(&handle.token.isolation().capability_sids)?;

        // Attribute list of exactly one entry: SECURITY_CAPABILITIES.
        let mut size = 0usize;
        unsafe {
            InitializeProcThreadAttributeList(std::ptr::null_mut(), 1, 0, &mut size);
        }
        attr_buf.resize(size, 0);
        let list = attr_buf.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST;
        let ok = unsafe { InitializeProcThreadAttributeList(list, 1, 0, &mut size) };
        if ok == 0 {
            let err = io::Error::last_os_error();
            free_capability_sids(&cap_attrs);
            return Err(Error::os("InitializeProcThreadAttributeList", err));
        }

        caps.AppContainerSid = handle.token.appcontainer_sid();
        caps.CapabilityCount = cap_attrs.len() as u32;
        caps.Capabilities = if cap_attrs.is_empty() {
            std::ptr::null_mut()
        } else {
            cap_attrs.as_mut_ptr()
        };

        let ok = unsafe {
            UpdateProcThreadAttribute(
                list,
                0,
                PROC_THREAD_ATTRIBUTE_SECURITY_CAPABILITIES as usize,
                std::ptr::addr_of_mut!(caps).cast(),
                std::mem::size_of::<SECURITY_CAPABILITIES>(),
                std::ptr::null_mut(),
                std::ptr::null(),
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            unsafe { DeleteProcThreadAttributeList(list) };
            free_capability_sids(&cap_attrs);
            return Err(Error::os("UpdateProcThreadAttribute", err));
        }
        startup.lpAttributeList = list;
    }

    let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    let ok = unsafe {
        CreateProcessAsUserW(
            handle.token.token(),
            std::ptr::null(),
            cmdline.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            0,
            CREATE_SUSPENDED | CREATE_UNICODE_ENVIRONMENT | EXTENDED_STARTUPINFO_PRESENT,
            env.as_mut_ptr().cast(),
            std::ptr::null(),
            std::ptr::addr_of_mut!(startup).cast(),
            &mut info,
        )
    };

    if use_appcontainer {
        unsafe { DeleteProcThreadAttributeList(startup.lpAttributeList) };
        free_capability_sids(&cap_attrs);
    }

    if ok == 0 {
        return Err(Error::os("CreateProcessAsUserW", io::Error::last_os_error()));
    }
    Ok(info)
}

/// Blocks until the process exits and returns its exit code.
fn wait_process(process: HANDLE) -> Result<i32> {
    use windows_sys::Win32::Foundation::WAIT_OBJECT_0;
    use windows_sys::Win32::System::Threading::{GetExitCodeProcess, INFINITE, WaitForSingleObject};

    let rc = unsafe { WaitForSingleObject(process, INFINITE) };
    if rc != WAIT_OBJECT_0 {
        return Err(Error::os("WaitForSingleObject", io::Error::last_os_error()));
    }
    let mut code: u32 = 0;
    let ok = unsafe { GetExitCodeProcess(process, &mut code) };
    if ok == 0 {
        return Err(Error::os("GetExitCodeProcess", io::Error::last_os_error()));
    }
    #[allow(clippy::cast_possible_wrap)]
    Ok(code as i32)
}

/// Composes layers for this backend, rejecting overlays first.
pub fn compose_layers(
    layer_vec: &[layers::Layer],
    id: &str,
    runtime_root: &Path,
) -> Result<LayerContext> {
    layers::validate_for_windows(layer_vec)?;
    layers::compose(layer_vec, id, runtime_root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lcow_document_carries_hv_runtime() {
        let guest = GuestConfig {
            lcow: true,
            uvm_image: Some(PathBuf::from(r"C:\uvm\image")),
            kernel: Some(PathBuf::from(r"C:\uvm\kernel")),
            initrd: None,
            boot_params: Some("console=ttyS0".to_owned()),
            parent_layers: None,
        };
        let doc = schema1_document(&guest, "abc1234567890xyz", Path::new(r"C:\run\abc")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(value["SystemType"], "Container");
        assert_eq!(value["HvPartition"], true);
        assert_eq!(value["ContainerType"], "linux");
        assert_eq!(value["HvRuntime"]["ImagePath"], r"C:\uvm\image");
        assert_eq!(value["HvRuntime"]["LinuxKernelFile"], r"C:\uvm\kernel");
        assert_eq!(value["HvRuntime"]["LinuxBootParameters"], "console=ttyS0");
        assert!(value["HvRuntime"].get("LinuxInitrdFile").is_none());
    }

    #[test]
    fn wcow_document_unflattens_parent_layers() {
        let guest = GuestConfig {
            parent_layers: Some("C:\\layers\\base\n  C:\\layers\\tools  \n\n".to_owned()),
            ..GuestConfig::default()
        };
        let doc = schema1_document(&guest, "abc1234567890xyz", Path::new(r"C:\run\abc")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(value["HvPartition"], false);
        assert!(value.get("HvRuntime").is_none());
        let layers = value["Layers"].as_array().unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0]["Path"], r"C:\layers\base");
        assert_eq!(layers[1]["Path"], r"C:\layers\tools");
    }

    #[test]
    fn lcow_document_requires_uvm_image() {
        let guest = GuestConfig {
            lcow: true,
            ..GuestConfig::default()
        };
        assert!(schema1_document(&guest, "abc1234567890xyz", Path::new(r"C:\run")).is_err());
    }
}
