//! Length-prefixed packet codec over any `Read`/`Write` stream.
//!
//! Each packet is: `[u32 big-endian length][postcard payload]`.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Maximum allowed packet payload (16 MiB).
const MAX_PACKET: u32 = 16 * 1024 * 1024;

/// Encodes `msg` as a length-prefixed postcard packet and writes it to `w`.
pub fn write_packet<W: Write>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "packet exceeds u32::MAX"))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&payload)?;
    w.flush()
}

/// Reads a length-prefixed postcard packet from `r` and decodes it.
pub fn read_packet<T: for<'de> Deserialize<'de>>(r: &mut impl Read) -> io::Result<T> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    let len = u32::from_be_bytes(buf);
    if len > MAX_PACKET {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "packet exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    postcard::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
