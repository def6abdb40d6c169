//! Wire protocol for client↔cvd communication.
//!
//! Packets are serialized with [`postcard`] and framed with a 4-byte
//! big-endian length prefix, suitable for any reliable byte stream
//! (Unix socket, abstract socket, TCP loopback).

mod codec;
mod message;

pub use codec::{read_packet, write_packet};
pub use message::{
    CreateReq, Direction, GuestType, LayerSpec, LayerType, NetworkSpec, PolicySpec, Request,
    Response, SpawnFlags, SpawnReq, Status, TransferReq, WindowsGuest,
};

/// Default cvd API address on Linux (abstract namespace).
pub const DEFAULT_LOCAL_ADDRESS: &str = "@/chef/cvd/api";

/// Default cvd API port on Windows (AF_INET loopback).
pub const DEFAULT_INET_PORT: u16 = 51003;
