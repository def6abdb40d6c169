//! Process-wide container table.
//!
//! The registry owns every live container and its spawned processes.
//! It is driven only from the daemon's event loop, so it needs no
//! locking; tests drive it directly with an in-memory backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use containerv::backend::{ContainerBackend, ContainerOptions, NetworkConfig, SpawnOptions};
use containerv::layers::{Layer, LayerKind};
use containerv::policy::{PathRule, Policy};
use containerv::{Error, generate_container_id, layers};
use containerv_proto::{
    CreateReq, Direction, LayerSpec, LayerType, Request, Response, SpawnReq, Status, TransferReq,
};

/// One live container with its spawned processes.
struct Entry<B: ContainerBackend> {
    /// Backend handle.
    handle: B::Handle,
    /// Live processes, keyed by public id.
    processes: HashMap<u32, B::Process>,
    /// Next public process id to hand out.
    next_process_id: u32,
}

impl<B: ContainerBackend> Entry<B> {
    /// Allocates the next public process id.
    ///
    /// Ids start at 1 and zero is reserved; on overflow the counter
    /// wraps back to 1. The wrap does not check for collision with a
    /// still-live id.
    fn next_process_id(&mut self) -> u32 {
        let id = self.next_process_id;
        self.next_process_id = self.next_process_id.wrapping_add(1);
        if self.next_process_id == 0 {
            self.next_process_id = 1;
        }
        id
    }
}

/// The container table plus the backend driving it.
pub struct Registry<B: ContainerBackend> {
    /// OS backend.
    backend: B,
    /// Root directory for per-container staging state.
    runtime_root: PathBuf,
    /// Plugin names applied when a request names none.
    default_policy: Vec<String>,
    /// Host path grants appended to every policy.
    custom_paths: Vec<PathRule>,
    /// Live containers, keyed by id.
    containers: HashMap<String, Entry<B>>,
}

impl<B: ContainerBackend> std::fmt::Debug for Registry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("runtime_root", &self.runtime_root)
            .field("containers", &self.containers.len())
            .finish_non_exhaustive()
    }
}

/// Maps an engine error onto the wire status set.
fn status_for(err: &Error) -> Status {
    match err {
        Error::InvalidPath(_) | Error::InvalidLayer(_) => Status::InvalidMounts,
        Error::Os { .. } | Error::Io(_) => Status::FailedRootfsSetup,
        _ => Status::InternalError,
    }
}

impl<B: ContainerBackend> Registry<B> {
    /// Creates an empty registry.
    pub fn new(backend: B, runtime_root: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            runtime_root: runtime_root.into(),
            default_policy: vec!["minimal".to_owned()],
            custom_paths: Vec::new(),
            containers: HashMap::new(),
        }
    }

    /// Sets the policy defaults taken from the daemon configuration.
    pub fn with_security(mut self, default_policy: Vec<String>, custom_paths: Vec<PathRule>) -> Self {
        self.default_policy = default_policy;
        self.custom_paths = custom_paths;
        self
    }

    /// Number of live containers.
    pub fn len(&self) -> usize {
        self.containers.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Dispatches one request and produces its response.
    ///
    /// Every path through here returns a response; errors are folded
    /// into the status code and logged, never propagated to the
    /// event loop.
    pub fn handle(&mut self, request: Request) -> Response {
        match request {
            Request::Create(req) => self.create(req),
            Request::Spawn(req) => self.spawn(req),
            Request::Kill {
                container_id,
                process_id,
            } => self.kill(&container_id, process_id),
            Request::Transfer(req) => self.transfer(req),
            Request::Destroy { container_id } => self.destroy(&container_id),
            // The request enum is non_exhaustive; a variant this daemon
            // does not know cannot be decoded from the wire, so this arm
            // only satisfies protocol growth.
            other => {
                warn!(request = ?other, "unhandled request variant");
                Response::Destroy {
                    status: Status::InternalError,
                }
            }
        }
    }

    /// Creates a container from layers and a policy.
    pub fn create(&mut self, req: CreateReq) -> Response {
        let id = match req.id.clone() {
            Some(id) => id,
            None => match generate_container_id() {
                Ok(id) => id,
                Err(e) => {
                    warn!(error = %e, "container id generation failed");
                    return Response::Create {
                        id: String::new(),
                        status: Status::InternalError,
                    };
                }
            },
        };
        let status = self.try_create(&id, req);
        if let Err(ref e) = status {
            warn!(container = %id, error = %e, "create failed");
        }
        Response::Create {
            id,
            status: match status {
                Ok(()) => Status::Success,
                Err(e) => status_for(&e),
            },
        }
    }

    /// Fallible body of [`Registry::create`].
    fn try_create(&mut self, id: &str, req: CreateReq) -> Result<(), Error> {
        if self.containers.contains_key(id) {
            return Err(Error::Backend(format!("container {id} already exists")));
        }

        let plugin_names = if req.policy.plugins.is_empty() {
            self.default_policy.clone()
        } else {
            req.policy.plugins.clone()
        };
        let policy = Policy::from_names(&plugin_names, self.custom_paths.clone())?;

        let layer_vec: Vec<Layer> = req.layers.iter().map(layer_from_spec).collect();
        let ctx = layers::compose(&layer_vec, id, &self.runtime_root)?;

        let opts = ContainerOptions {
            hostname: Some(id.to_owned()),
            policy,
            network: NetworkConfig {
                container_ip: req.network.container_ip.clone(),
                container_netmask: req.network.container_netmask.clone(),
                host_ip: req.network.host_ip.clone(),
                gateway_ip: req.network.gateway_ip.clone(),
                dns: req.network.dns.clone(),
            },
            guest_windows: req.guest_windows,
        };

        // The backend tears the layer context down itself on failure.
        let handle = self.backend.create(id, &opts, ctx)?;
        self.containers.insert(
            id.to_owned(),
            Entry {
                handle,
                processes: HashMap::new(),
                next_process_id: 1,
            },
        );
        info!(container = %id, "container created");
        Ok(())
    }

    /// Spawns a process inside a container.
    pub fn spawn(&mut self, req: SpawnReq) -> Response {
        let Some(entry) = self.containers.get_mut(&req.container_id) else {
            return Response::Spawn {
                process_id: 0,
                exit_code: None,
                status: Status::InvalidContainerId,
            };
        };

        let opts = SpawnOptions {
            argv: split_command(&req.command),
            env: req.environment,
            wait: req.options.wait,
            cpu_percent: None,
        };

        let outcome = match self.backend.spawn(&mut entry.handle, &opts) {
            Ok(o) => o,
            Err(e) => {
                warn!(container = %req.container_id, error = %e, "spawn failed");
                return Response::Spawn {
                    process_id: 0,
                    exit_code: None,
                    status: status_for(&e),
                };
            }
        };

        let process_id = entry.next_process_id();
        // A waited spawn has already exited and been reaped; registering
        // it would leave a dead record that only an explicit kill could
        // clear.
        if outcome.exit_code.is_none()
            && let Some(stale) = entry.processes.insert(process_id, outcome.process.clone())
        {
            // Wrap collision: the public id was reused while its old
            // process was still registered. Kill the new child rather
            // than leave two processes under one id.
            entry.processes.insert(process_id, stale);
            if let Err(e) = self.backend.kill(&mut entry.handle, &outcome.process) {
                warn!(container = %req.container_id, error = %e, "orphan kill failed");
            }
            return Response::Spawn {
                process_id: 0,
                exit_code: None,
                status: Status::InternalError,
            };
        }

        Response::Spawn {
            process_id,
            exit_code: outcome.exit_code,
            status: Status::Success,
        }
    }

    /// Kills a spawned process and removes its record.
    pub fn kill(&mut self, container_id: &str, process_id: u32) -> Response {
        let Some(entry) = self.containers.get_mut(container_id) else {
            return Response::Kill {
                status: Status::InvalidContainerId,
            };
        };
        let Some(process) = entry.processes.remove(&process_id) else {
            return Response::Kill {
                status: Status::InternalError,
            };
        };
        let status = match self.backend.kill(&mut entry.handle, &process) {
            Ok(()) => Status::Success,
            Err(e) => {
                warn!(container = %container_id, process_id, error = %e, "kill failed");
                status_for(&e)
            }
        };
        Response::Kill { status }
    }

    /// Copies files between host and container, pairwise.
    pub fn transfer(&mut self, req: TransferReq) -> Response {
        let Some(entry) = self.containers.get(&req.container_id) else {
            return Response::Transfer {
                status: Status::InvalidContainerId,
            };
        };
        if req.source_path.len() != req.destination_path.len() || req.source_path.is_empty() {
            return Response::Transfer {
                status: Status::InvalidMounts,
            };
        }

        let sources: Vec<PathBuf> = req.source_path.iter().map(PathBuf::from).collect();
        let dests: Vec<PathBuf> = req.destination_path.iter().map(PathBuf::from).collect();
        let result = match req.direction {
            Direction::Upload => self.backend.upload(&entry.handle, &sources, &dests),
            Direction::Download => self.backend.download(&entry.handle, &sources, &dests),
        };
        let status = match result {
            Ok(()) => Status::Success,
            Err(e) => {
                warn!(container = %req.container_id, error = %e, "transfer failed");
                status_for(&e)
            }
        };
        Response::Transfer { status }
    }

    /// Tears down a container and everything in it.
    pub fn destroy(&mut self, container_id: &str) -> Response {
        let Some(entry) = self.containers.remove(container_id) else {
            return Response::Destroy {
                status: Status::InvalidContainerId,
            };
        };
        let status = match self.backend.destroy(entry.handle) {
            Ok(()) => {
                info!(container = %container_id, "container destroyed");
                Status::Success
            }
            Err(e) => {
                warn!(container = %container_id, error = %e, "destroy failed");
                status_for(&e)
            }
        };
        Response::Destroy { status }
    }

    /// Destroys every remaining container; used at daemon shutdown.
    pub fn shutdown(&mut self) {
        let ids: Vec<String> = self.containers.keys().cloned().collect();
        for id in ids {
            self.destroy(&id);
        }
    }
}

/// Splits a wire command at the first space into argv.
fn split_command(command: &str) -> Vec<String> {
    match command.split_once(' ') {
        Some((head, rest)) => {
            let mut argv = vec![head.to_owned()];
            argv.extend(rest.split_whitespace().map(str::to_owned));
            argv
        }
        None => vec![command.to_owned()],
    }
}

/// Converts a wire layer spec into an engine layer.
fn layer_from_spec(spec: &LayerSpec) -> Layer {
    let kind = match spec.kind {
        LayerType::BaseRootfs => LayerKind::BaseRootfs,
        LayerType::VafsPackage => LayerKind::VafsPackage,
        LayerType::HostDirectory => LayerKind::HostDirectory,
        LayerType::Overlay => LayerKind::Overlay,
    };
    let layer = Layer::new(kind, Path::new(&spec.source), spec.target.clone());
    if spec.readonly { layer.readonly() } else { layer }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_command_separates_argv0() {
        assert_eq!(split_command("/bin/true"), ["/bin/true"]);
        assert_eq!(split_command("/bin/echo hi there"), [
            "/bin/echo", "hi", "there"
        ]);
    }
}
