//! Containerized build/runtime engine.
//!
//! `containerv` turns an ordered list of rootfs layers plus a declarative
//! security policy into a running container, then multiplexes process
//! spawns through the container's PID-1 manager.
//!
//! # Quick start
//!
//! ```no_run
//! use std::path::Path;
//!
//! use containerv::layers::{Layer, LayerKind};
//! use containerv::policy::Policy;
//!
//! let policy = Policy::from_names(&["build".into()], Vec::new()).expect("known plugins");
//! let layers = vec![Layer::new(LayerKind::BaseRootfs, "/srv/base-rootfs", "/")];
//! let ctx = containerv::layers::compose(&layers, "abc1234567890xyz", Path::new("/run/chef"))
//!     .expect("compose failed");
//! # let _ = (policy, ctx);
//! ```

pub mod backend;
#[cfg(unix)]
pub mod bpf;
mod error;
mod id;
pub mod layers;
pub mod oci;
pub mod path;
#[cfg(unix)]
pub mod pid1;
pub mod policy;

pub use error::{Error, Result};
pub use id::generate_container_id;
