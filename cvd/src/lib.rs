//! The container daemon.
//!
//! `cvd` exposes the [`containerv`] engine over a packet RPC socket.
//! A single event loop accepts one connection at a time and dispatches
//! requests against the in-process [`registry::Registry`]; nothing in
//! the daemon is shared across threads.
//!
//! The wire format and address defaults live in [`containerv_proto`].

pub mod client;
pub mod config;
pub mod registry;
pub mod server;

pub use config::Config;
pub use registry::Registry;
