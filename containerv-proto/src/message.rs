//! Request/response packet types for the cvd API.

use serde::{Deserialize, Serialize};

/// Request sent from a client to the daemon.
#[derive(Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Request {
    /// Create a container from layers and a security policy.
    Create(CreateReq),
    /// Spawn a process inside a container.
    Spawn(SpawnReq),
    /// Kill a process previously returned by spawn.
    Kill {
        /// Target container ID.
        container_id: String,
        /// Public process ID (never zero).
        process_id: u32,
    },
    /// Copy files between host and container.
    Transfer(TransferReq),
    /// Tear down a container and everything in it.
    Destroy {
        /// Target container ID.
        container_id: String,
    },
}

/// Container creation request.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CreateReq {
    /// Caller-chosen container ID; generated by the daemon when absent.
    pub id: Option<String>,
    /// Ordered rootfs layers (later layers override earlier ones).
    pub layers: Vec<LayerSpec>,
    /// Security policy selection.
    pub policy: PolicySpec,
    /// Optional network configuration.
    pub network: NetworkSpec,
    /// Windows guest parameters (LCOW/WCOW); ignored on Linux.
    pub guest_windows: Option<WindowsGuest>,
}

/// One entry in the ordered layer vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Layer flavor.
    pub kind: LayerType,
    /// Host-side source path (rootfs dir, pack file, or directory).
    pub source: String,
    /// Target path inside the container ("/" for the base).
    pub target: String,
    /// Mount read-only.
    pub readonly: bool,
}

/// Layer flavor tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerType {
    /// Base root filesystem directory.
    BaseRootfs,
    /// VaFS pack staged for unpacking.
    VafsPackage,
    /// Host directory bind-mounted into the container.
    HostDirectory,
    /// Overlayfs upper/work contribution (Linux only).
    Overlay,
}

/// Security policy selection: ordered plugin names.
///
/// The "minimal" plugin is always applied first regardless of contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Plugin names, e.g. `["build", "network"]`.
    pub plugins: Vec<String>,
}

/// Optional container network configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSpec {
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

/// Windows guest parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowsGuest {
    /// LCOW or WCOW.
    pub guest_type: GuestType,
    /// UVM image path (required for LCOW).
    pub uvm_image: Option<String>,
    /// Kernel path override.
    pub kernel: Option<String>,
    /// Initrd path override.
    pub initrd: Option<String>,
    /// Kernel boot parameters.
    pub boot_params: Option<String>,
    /// WCOW parent layers, newline-flattened.
    pub parent_layers: Option<String>,
}

/// Windows container flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestType {
    /// Linux Containers On Windows (requires a UVM image).
    Lcow,
    /// Windows Containers On Windows.
    Wcow,
}

/// Process spawn request.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpawnReq {
    /// Target container ID.
    pub container_id: String,
    /// Command line; split at the first space into argv[0] and remainder.
    pub command: String,
    /// Flat `KEY=VALUE` environment array.
    pub environment: Vec<String>,
    /// Spawn behavior flags.
    pub options: SpawnFlags,
}

/// Spawn behavior flags.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpawnFlags {
    /// Block until the child exits and surface its exit code.
    pub wait: bool,
}

/// File transfer request.
#[derive(Debug, Serialize, Deserialize)]
pub struct TransferReq {
    /// Target container ID.
    pub container_id: String,
    /// Source paths (host paths for upload, container paths for download).
    pub source_path: Vec<String>,
    /// Destination paths, pairwise with `source_path`.
    pub destination_path: Vec<String>,
    /// Copy direction.
    pub direction: Direction,
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Host → container.
    Upload,
    /// Container → host.
    Download,
}

/// Response sent from the daemon to a client.
#[derive(Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Response {
    /// Reply to [`Request::Create`].
    Create {
        /// The container ID (caller-chosen or generated).
        id: String,
        /// Operation status.
        status: Status,
    },
    /// Reply to [`Request::Spawn`].
    Spawn {
        /// Public process ID (zero when status is not `Success`).
        process_id: u32,
        /// Exit code, present when the spawn waited for completion.
        exit_code: Option<i32>,
        /// Operation status.
        status: Status,
    },
    /// Reply to [`Request::Kill`].
    Kill {
        /// Operation status.
        status: Status,
    },
    /// Reply to [`Request::Transfer`].
    Transfer {
        /// Operation status.
        status: Status,
    },
    /// Reply to [`Request::Destroy`].
    Destroy {
        /// Operation status.
        status: Status,
    },
}

/// Normative status codes shared by every cvd operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Operation completed.
    Success,
    /// No container with the given ID exists.
    InvalidContainerId,
    /// Layer or mount specification was rejected.
    InvalidMounts,
    /// Rootfs composition or backend setup failed.
    FailedRootfsSetup,
    /// Unexpected daemon-side failure.
    InternalError,
}

impl Status {
    /// Numeric code as reported on the wire and in logs.
    pub const fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::InvalidContainerId => 1,
            Self::InvalidMounts => 2,
            Self::FailedRootfsSetup => 3,
            Self::InternalError => 4,
        }
    }

    /// Returns `true` for [`Status::Success`].
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::InvalidContainerId => "invalid-container-id",
            Self::InvalidMounts => "invalid-mounts",
            Self::FailedRootfsSetup => "failed-rootfs-setup",
            Self::InternalError => "internal-error",
        })
    }
}
