//! OCI bundle synthesis.
//!
//! Produces `<runtime_root>/oci-bundle/{config.json, rootfs/}` with a
//! compact `config.json` matching runtime-spec 1.0.2, and prepares the
//! composed rootfs: standard mountpoint directories plus
//! `/etc/{hosts,hostname,resolv.conf}`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::path::normalize;
use crate::{Error, Result};

/// OCI version emitted in every bundle.
pub const OCI_VERSION: &str = "1.0.2";

/// PATH injected when the caller did not supply one.
const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Paths masked inside every container.
pub const MASKED_PATHS: &[&str] = &[
    "/proc/kcore",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

/// Paths remounted read-only inside every container.
pub const READONLY_PATHS: &[&str] = &[
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Standard mountpoint directories created with mode 0755.
const MOUNTPOINT_DIRS: &[&str] = &[
    "proc",
    "sys",
    "sys/fs/cgroup",
    "dev",
    "dev/pts",
    "dev/shm",
    "dev/mqueue",
    "etc",
];

/// One caller-supplied bind mount.
#[derive(Debug, Clone)]
pub struct BindMount {
    /// Host source path.
    pub source: String,
    /// In-container destination.
    pub destination: String,
    /// Mount read-only.
    pub readonly: bool,
}

/// Parameters for bundle synthesis.
#[derive(Debug, Clone, Default)]
pub struct BundleParams {
    /// Composed rootfs; becomes `root.path` in `config.json`.
    pub root_path: PathBuf,
    /// Process arguments as a JSON array string, e.g. `["/bin/sh","-c","id"]`.
    pub args_json: String,
    /// Flat `KEY=VALUE` environment.
    pub env: Vec<String>,
    /// Working directory; defaults to `/`.
    pub cwd: Option<String>,
    /// Container hostname.
    pub hostname: Option<String>,
    /// DNS servers, separated by `,`, `;`, or whitespace.
    pub dns: Option<String>,
    /// Caller bind mounts, appended after the fixed table.
    pub mounts: Vec<BindMount>,
}

/// A synthesized on-disk bundle.
#[derive(Debug)]
pub struct Bundle {
    /// Bundle directory (`<runtime_root>/oci-bundle`).
    pub dir: PathBuf,
    /// Path of the emitted `config.json`.
    pub config_path: PathBuf,
}

// --- runtime-spec 1.0.2 subset -------------------------------------------

/// Top-level `config.json` document.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    /// Always [`OCI_VERSION`].
    pub oci_version: String,
    /// Container process description.
    pub process: ProcessSpec,
    /// Root filesystem reference.
    pub root: RootSpec,
    /// Optional hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Fixed mount table plus caller binds.
    pub mounts: Vec<MountSpec>,
    /// Linux-specific section.
    pub linux: LinuxSpec,
}

/// `process` object.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    /// Always false; cvd containers have no terminal.
    pub terminal: bool,
    /// Always uid 0 / gid 0 inside the user namespace.
    pub user: UserSpec,
    /// Parsed argument vector.
    pub args: Vec<String>,
    /// Environment with PATH guaranteed present.
    pub env: Vec<String>,
    /// Working directory.
    pub cwd: String,
}

/// `process.user` object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UserSpec {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

/// `root` object.
#[derive(Debug, Serialize, Deserialize)]
pub struct RootSpec {
    /// Rootfs path.
    pub path: String,
    /// Always false.
    pub readonly: bool,
}

/// One `mounts` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    /// In-container destination.
    pub destination: String,
    /// Filesystem type.
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Mount source.
    pub source: String,
    /// Mount options.
    pub options: Vec<String>,
}

/// `linux` object.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxSpec {
    /// Namespace set.
    pub namespaces: Vec<NamespaceSpec>,
    /// Fixed device table.
    pub devices: Vec<DeviceSpec>,
    /// Cgroup resources (device allows).
    pub resources: ResourcesSpec,
    /// Masked paths.
    pub masked_paths: Vec<String>,
    /// Read-only paths.
    pub readonly_paths: Vec<String>,
}

/// One `linux.namespaces` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceSpec {
    /// Namespace type.
    #[serde(rename = "type")]
    pub ns_type: String,
}

/// One `linux.devices` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    /// Device node path.
    pub path: String,
    /// Device type (`c`).
    #[serde(rename = "type")]
    pub dev_type: String,
    /// Major number.
    pub major: i64,
    /// Minor number.
    pub minor: i64,
    /// Node mode.
    pub file_mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
}

/// `linux.resources` object.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResourcesSpec {
    /// Device cgroup entries.
    pub devices: Vec<DeviceCgroupSpec>,
}

/// One device-cgroup entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCgroupSpec {
    /// Allow or deny.
    pub allow: bool,
    /// Device type, absent for the deny-all rule.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub dev_type: Option<String>,
    /// Major number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub major: Option<i64>,
    /// Minor number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor: Option<i64>,
    /// Access string.
    pub access: String,
}

/// Fixed device table: path, major, minor.
const DEVICES: &[(&str, i64, i64)] = &[
    ("/dev/null", 1, 3),
    ("/dev/zero", 1, 5),
    ("/dev/full", 1, 7),
    ("/dev/random", 1, 8),
    ("/dev/urandom", 1, 9),
    ("/dev/tty", 5, 0),
];

/// Fixed mount table with canonical option sets.
fn fixed_mounts() -> Vec<MountSpec> {
    let entry = |dest: &str, fs_type: &str, source: &str, options: &[&str]| MountSpec {
        destination: dest.to_owned(),
        fs_type: fs_type.to_owned(),
        source: source.to_owned(),
        options: options.iter().map(|s| (*s).to_owned()).collect(),
    };
    vec![
        entry("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"]),
        entry("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
        entry(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        ),
        entry(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        entry(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        entry(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        entry("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
    ]
}

/// Builds the in-memory `config.json` document.
pub fn synthesize_spec(params: &BundleParams) -> Result<Spec> {
    let args: Vec<String> = if params.args_json.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&params.args_json)?
    };

    let mut env = params.env.clone();
    // Key comparison only; byte-slicing the entry would panic on a
    // multibyte key.
    let has_path = env
        .iter()
        .any(|e| e.split_once('=').is_some_and(|(key, _)| key.eq_ignore_ascii_case("path")));
    if !has_path {
        env.insert(0, DEFAULT_PATH.to_owned());
    }

    let mut mounts = fixed_mounts();
    for bind in &params.mounts {
        // Reject traversal before the mount ever reaches the plan.
        normalize(&bind.destination)?;
        mounts.push(MountSpec {
            destination: bind.destination.clone(),
            fs_type: "bind".to_owned(),
            source: bind.source.clone(),
            options: vec![
                "rbind".to_owned(),
                "rprivate".to_owned(),
                if bind.readonly { "ro" } else { "rw" }.to_owned(),
            ],
        });
    }

    let devices: Vec<DeviceSpec> = DEVICES
        .iter()
        .map(|(path, major, minor)| DeviceSpec {
            path: (*path).to_owned(),
            dev_type: "c".to_owned(),
            major: *major,
            minor: *minor,
            file_mode: 0o666,
            uid: 0,
            gid: 0,
        })
        .collect();

    let mut cgroup_devices = vec![DeviceCgroupSpec {
        allow: false,
        dev_type: None,
        major: None,
        minor: None,
        access: "rwm".to_owned(),
    }];
    cgroup_devices.extend(DEVICES.iter().map(|(_, major, minor)| DeviceCgroupSpec {
        allow: true,
        dev_type: Some("c".to_owned()),
        major: Some(*major),
        minor: Some(*minor),
        access: "rwm".to_owned(),
    }));

    Ok(Spec {
        oci_version: OCI_VERSION.to_owned(),
        process: ProcessSpec {
            terminal: false,
            user: UserSpec { uid: 0, gid: 0 },
            args,
            env,
            cwd: params.cwd.clone().unwrap_or_else(|| "/".to_owned()),
        },
        root: RootSpec {
            path: params.root_path.to_string_lossy().into_owned(),
            readonly: false,
        },
        hostname: params.hostname.clone(),
        mounts,
        linux: LinuxSpec {
            namespaces: ["pid", "ipc", "uts", "mount", "network"]
                .iter()
                .map(|n| NamespaceSpec {
                    ns_type: (*n).to_owned(),
                })
                .collect(),
            devices,
            resources: ResourcesSpec {
                devices: cgroup_devices,
            },
            masked_paths: MASKED_PATHS.iter().map(|s| (*s).to_owned()).collect(),
            readonly_paths: READONLY_PATHS.iter().map(|s| (*s).to_owned()).collect(),
        },
    })
}

/// Synthesizes the on-disk bundle and prepares the rootfs.
pub fn build_bundle(runtime_root: &Path, params: &BundleParams) -> Result<Bundle> {
    let dir = runtime_root.join("oci-bundle");
    let rootfs = dir.join("rootfs");
    fs::create_dir_all(&rootfs).map_err(|e| Error::os("create bundle", e))?;

    let spec = synthesize_spec(params)?;
    let config_path = dir.join("config.json");
    let file = fs::File::create(&config_path).map_err(|e| Error::os("create config.json", e))?;
    serde_json::to_writer_pretty(file, &spec)?;

    prepare_rootfs(
        &params.root_path,
        params.hostname.as_deref(),
        params.dns.as_deref(),
    )?;

    Ok(Bundle { dir, config_path })
}

/// Prepares a composed rootfs: mountpoint directories and `/etc` files.
pub fn prepare_rootfs(root: &Path, hostname: Option<&str>, dns: Option<&str>) -> Result<()> {
    for dir in MOUNTPOINT_DIRS {
        let target = root.join(normalize(dir)?);
        fs::create_dir_all(&target).map_err(|e| Error::os("create mountpoint", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(0o755))
                .map_err(|e| Error::os("chmod mountpoint", e))?;
        }
    }

    let host = hostname.unwrap_or("localhost");
    let etc = root.join("etc");
    fs::write(
        etc.join("hosts"),
        format!("127.0.0.1 localhost\n127.0.1.1 {host}\n"),
    )
    .map_err(|e| Error::os("write /etc/hosts", e))?;
    fs::write(etc.join("hostname"), format!("{host}\n"))
        .map_err(|e| Error::os("write /etc/hostname", e))?;

    let mut resolv = String::new();
    if let Some(list) = dns {
        for server in list
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|s| !s.is_empty())
        {
            resolv.push_str("nameserver ");
            resolv.push_str(server);
            resolv.push('\n');
        }
    }
    fs::write(etc.join("resolv.conf"), resolv).map_err(|e| Error::os("write /etc/resolv.conf", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(root: &Path) -> BundleParams {
        BundleParams {
            root_path: root.to_path_buf(),
            args_json: r#"["/bin/echo","hi"]"#.to_owned(),
            env: vec!["TERM=xterm".to_owned()],
            cwd: None,
            hostname: Some("builder".to_owned()),
            dns: Some("1.1.1.1, 8.8.8.8;9.9.9.9".to_owned()),
            mounts: vec![BindMount {
                source: "/srv/cache".to_owned(),
                destination: "/var/cache".to_owned(),
                readonly: true,
            }],
        }
    }

    #[test]
    fn bundle_emits_parsable_config_with_root_path() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("rootfs-composed");
        fs::create_dir_all(&root).unwrap();

        let bundle = build_bundle(tmp.path(), &params(&root)).unwrap();
        assert!(bundle.dir.join("rootfs").exists());

        let raw = fs::read_to_string(&bundle.config_path).unwrap();
        let spec: Spec = serde_json::from_str(&raw).unwrap();
        assert_eq!(spec.oci_version, OCI_VERSION);
        assert_eq!(spec.root.path, root.to_string_lossy());
        assert!(!spec.process.terminal);
        assert_eq!(spec.process.cwd, "/");
        assert_eq!(spec.process.args, vec!["/bin/echo", "hi"]);
    }

    #[test]
    fn default_path_injected_unless_supplied() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = params(tmp.path());
        let spec = synthesize_spec(&p).unwrap();
        assert!(spec.process.env[0].starts_with("PATH="));

        // Case-insensitive match on an existing key.
        p.env.push("Path=/custom".to_owned());
        let spec = synthesize_spec(&p).unwrap();
        assert!(!spec.process.env.iter().any(|e| e.starts_with("PATH=/usr")));
    }

    #[test]
    fn multibyte_env_keys_are_not_mistaken_for_path() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = params(tmp.path());
        p.env = vec!["ααα=x".to_owned(), "язык=ru".to_owned()];
        let spec = synthesize_spec(&p).unwrap();
        assert!(spec.process.env[0].starts_with("PATH=/usr"));
    }

    #[test]
    fn bind_mounts_appended_with_canonical_options() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = synthesize_spec(&params(tmp.path())).unwrap();
        let bind = spec.mounts.last().unwrap();
        assert_eq!(bind.fs_type, "bind");
        assert_eq!(bind.options, vec!["rbind", "rprivate", "ro"]);
        // Fixed table precedes caller binds.
        assert_eq!(spec.mounts[0].destination, "/proc");
        assert_eq!(spec.mounts.len(), 8);
    }

    #[test]
    fn traversal_in_mount_destination_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = params(tmp.path());
        p.mounts[0].destination = "/var/../../etc".to_owned();
        assert!(synthesize_spec(&p).is_err());
    }

    #[test]
    fn device_table_and_cgroup_allows_match() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = synthesize_spec(&params(tmp.path())).unwrap();
        assert_eq!(spec.linux.devices.len(), 6);
        // deny-all plus one allow per device.
        assert_eq!(spec.linux.resources.devices.len(), 7);
        assert!(!spec.linux.resources.devices[0].allow);
        assert_eq!(spec.linux.masked_paths.len(), 6);
        assert_eq!(spec.linux.readonly_paths.len(), 6);
    }

    #[test]
    fn rootfs_prep_writes_etc_files() {
        let tmp = tempfile::tempdir().unwrap();
        prepare_rootfs(tmp.path(), Some("builder"), Some("1.1.1.1,8.8.8.8")).unwrap();

        let hosts = fs::read_to_string(tmp.path().join("etc/hosts")).unwrap();
        assert_eq!(hosts, "127.0.0.1 localhost\n127.0.1.1 builder\n");
        let hostname = fs::read_to_string(tmp.path().join("etc/hostname")).unwrap();
        assert_eq!(hostname, "builder\n");
        let resolv = fs::read_to_string(tmp.path().join("etc/resolv.conf")).unwrap();
        assert_eq!(resolv, "nameserver 1.1.1.1\nnameserver 8.8.8.8\n");
        assert!(tmp.path().join("dev/pts").is_dir());
    }
}
