//! Registry and RPC behavior against an in-memory backend.
//!
//! None of these tests need root or namespaces; the backend records
//! what the registry asked for and answers deterministically.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use containerv::Result;
use containerv::backend::{ContainerBackend, ContainerOptions, SpawnOptions, SpawnOutcome};
use containerv::layers::LayerContext;
use containerv_proto::{
    CreateReq, LayerSpec, LayerType, NetworkSpec, PolicySpec, Request, Response, SpawnFlags,
    SpawnReq, Status,
};
use cvd::registry::Registry;

#[derive(Debug)]
struct FakeHandle {
    id: String,
    layers: Option<LayerContext>,
    live: HashSet<u32>,
}

#[derive(Debug, Default)]
struct FakeBackend {
    next_pid: AtomicU32,
}

impl ContainerBackend for FakeBackend {
    type Handle = FakeHandle;
    type Process = u32;

    fn create(&self, id: &str, _opts: &ContainerOptions, layers: LayerContext) -> Result<FakeHandle> {
        Ok(FakeHandle {
            id: id.to_owned(),
            layers: Some(layers),
            live: HashSet::new(),
        })
    }

    fn spawn(&self, handle: &mut FakeHandle, opts: &SpawnOptions) -> Result<SpawnOutcome<u32>> {
        assert!(!handle.id.is_empty());
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) + 1;
        handle.live.insert(pid);
        Ok(SpawnOutcome {
            process: pid,
            exit_code: opts.wait.then_some(0),
        })
    }

    fn kill(&self, handle: &mut FakeHandle, process: &u32) -> Result<()> {
        if handle.live.remove(process) {
            Ok(())
        } else {
            Err(containerv::Error::Backend(format!("no process {process}")))
        }
    }

    fn upload(&self, _handle: &FakeHandle, _sources: &[PathBuf], _dests: &[PathBuf]) -> Result<()> {
        Ok(())
    }

    fn download(
        &self,
        _handle: &FakeHandle,
        _sources: &[PathBuf],
        _dests: &[PathBuf],
    ) -> Result<()> {
        Ok(())
    }

    fn destroy(&self, mut handle: FakeHandle) -> Result<()> {
        if let Some(layers) = handle.layers.take() {
            layers.destroy()?;
        }
        Ok(())
    }
}

fn test_registry(runtime_root: &std::path::Path) -> Registry<FakeBackend> {
    Registry::new(FakeBackend::default(), runtime_root)
}

fn create_req(id: &str, base: &std::path::Path) -> CreateReq {
    CreateReq {
        id: Some(id.to_owned()),
        layers: vec![LayerSpec {
            kind: LayerType::BaseRootfs,
            source: base.to_string_lossy().into_owned(),
            target: "/".to_owned(),
            readonly: false,
        }],
        policy: PolicySpec::default(),
        network: NetworkSpec::default(),
        guest_windows: None,
    }
}

fn spawn_req(container_id: &str, command: &str, wait: bool) -> Request {
    Request::Spawn(SpawnReq {
        container_id: container_id.to_owned(),
        command: command.to_owned(),
        environment: Vec::new(),
        options: SpawnFlags { wait },
    })
}

#[test]
fn create_and_spawn_returns_first_process_id() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base");
    std::fs::create_dir(&base).unwrap();
    let mut registry = test_registry(dir.path());

    let resp = registry.handle(Request::Create(create_req("abc1234567890xyz", &base)));
    let Response::Create { id, status } = resp else {
        panic!("wrong response variant");
    };
    assert_eq!(id, "abc1234567890xyz");
    assert_eq!(status, Status::Success);

    let resp = registry.handle(spawn_req("abc1234567890xyz", "/bin/echo hi", true));
    let Response::Spawn {
        process_id,
        exit_code,
        status,
    } = resp
    else {
        panic!("wrong response variant");
    };
    assert_eq!(status, Status::Success);
    assert_eq!(process_id, 1);
    assert_eq!(exit_code, Some(0));
}

#[test]
fn spawn_into_unknown_container_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = test_registry(dir.path());

    let resp = registry.handle(spawn_req("no-such-id", "/bin/true", true));
    let Response::Spawn { status, process_id, .. } = resp else {
        panic!("wrong response variant");
    };
    assert_eq!(status, Status::InvalidContainerId);
    assert_eq!(process_id, 0);
}

#[test]
fn duplicate_container_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base");
    std::fs::create_dir(&base).unwrap();
    let mut registry = test_registry(dir.path());

    registry.handle(Request::Create(create_req("cafedeadbeef0001", &base)));
    let Response::Create { status, .. } =
        registry.handle(Request::Create(create_req("cafedeadbeef0001", &base)))
    else {
        panic!("wrong response variant");
    };
    assert_ne!(status, Status::Success);
    assert_eq!(registry.len(), 1);
}

#[test]
fn non_base_first_layer_is_invalid_mounts() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = test_registry(dir.path());

    let mut req = create_req("cafedeadbeef0002", dir.path());
    req.layers[0].kind = LayerType::HostDirectory;
    let Response::Create { status, .. } = registry.handle(Request::Create(req)) else {
        panic!("wrong response variant");
    };
    assert_eq!(status, Status::InvalidMounts);
}

#[test]
fn kill_twice_errors_the_second_time() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base");
    std::fs::create_dir(&base).unwrap();
    let mut registry = test_registry(dir.path());

    registry.handle(Request::Create(create_req("cafedeadbeef0003", &base)));
    let Response::Spawn { process_id, .. } =
        registry.handle(spawn_req("cafedeadbeef0003", "/bin/sleep 30", false))
    else {
        panic!("wrong response variant");
    };
    assert!(process_id > 0);

    let kill = |registry: &mut Registry<FakeBackend>| {
        registry.handle(Request::Kill {
            container_id: "cafedeadbeef0003".to_owned(),
            process_id,
        })
    };
    let Response::Kill { status } = kill(&mut registry) else {
        panic!("wrong response variant");
    };
    assert_eq!(status, Status::Success);
    let Response::Kill { status } = kill(&mut registry) else {
        panic!("wrong response variant");
    };
    assert_ne!(status, Status::Success);
}

#[test]
fn waited_spawn_leaves_no_process_record() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base");
    std::fs::create_dir(&base).unwrap();
    let mut registry = test_registry(dir.path());

    registry.handle(Request::Create(create_req("cafedeadbeef0006", &base)));
    let Response::Spawn { process_id, exit_code, status } =
        registry.handle(spawn_req("cafedeadbeef0006", "/bin/true", true))
    else {
        panic!("wrong response variant");
    };
    assert_eq!(status, Status::Success);
    assert_eq!(exit_code, Some(0));

    // The child has already been reaped; nothing to kill remains.
    let Response::Kill { status } = registry.handle(Request::Kill {
        container_id: "cafedeadbeef0006".to_owned(),
        process_id,
    }) else {
        panic!("wrong response variant");
    };
    assert_ne!(status, Status::Success);

    // A background spawn still registers and can be killed.
    let Response::Spawn { process_id, .. } =
        registry.handle(spawn_req("cafedeadbeef0006", "/bin/sleep 30", false))
    else {
        panic!("wrong response variant");
    };
    let Response::Kill { status } = registry.handle(Request::Kill {
        container_id: "cafedeadbeef0006".to_owned(),
        process_id,
    }) else {
        panic!("wrong response variant");
    };
    assert_eq!(status, Status::Success);
}

#[test]
fn destroy_removes_the_container() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base");
    std::fs::create_dir(&base).unwrap();
    let mut registry = test_registry(dir.path());

    registry.handle(Request::Create(create_req("cafedeadbeef0004", &base)));
    let Response::Destroy { status } = registry.handle(Request::Destroy {
        container_id: "cafedeadbeef0004".to_owned(),
    }) else {
        panic!("wrong response variant");
    };
    assert_eq!(status, Status::Success);
    assert!(registry.is_empty());

    let Response::Spawn { status, .. } =
        registry.handle(spawn_req("cafedeadbeef0004", "/bin/true", true))
    else {
        panic!("wrong response variant");
    };
    assert_eq!(status, Status::InvalidContainerId);
}

#[test]
fn generated_ids_are_unique_and_well_formed() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base");
    std::fs::create_dir(&base).unwrap();
    let mut registry = test_registry(dir.path());

    let mut seen = HashSet::new();
    for _ in 0..8 {
        let mut req = create_req("", &base);
        req.id = None;
        let Response::Create { id, status } = registry.handle(Request::Create(req)) else {
            panic!("wrong response variant");
        };
        assert_eq!(status, Status::Success);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(seen.insert(id));
    }
}

#[cfg(unix)]
#[test]
fn session_dispatches_over_a_socketpair() {
    use std::os::unix::net::UnixStream;

    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base");
    std::fs::create_dir(&base).unwrap();
    let mut registry = test_registry(dir.path());

    let (mut client, server) = UnixStream::pair().unwrap();
    let req = Request::Create(create_req("cafedeadbeef0005", &base));
    containerv_proto::write_packet(&mut client, &req).unwrap();

    let handle = std::thread::spawn(move || {
        let mut r = registry;
        cvd::server::session(server, &mut r).unwrap();
        r
    });

    let Response::Create { id, status } = containerv_proto::read_packet(&mut client).unwrap()
    else {
        panic!("wrong response variant");
    };
    assert_eq!(id, "cafedeadbeef0005");
    assert_eq!(status, Status::Success);

    drop(client);
    let registry = handle.join().unwrap();
    assert_eq!(registry.len(), 1);
}
