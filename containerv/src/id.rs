//! Container identifier generation.

use crate::{Error, Result};

/// Alphabet for container identifiers.
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of a container identifier.
pub(crate) const ID_LEN: usize = 16;

/// Generates a 16-character random container identifier.
///
/// Bytes come from the OS CSPRNG, so identifiers are unpredictable and
/// collision-safe for the lifetime of a registry.
pub fn generate_container_id() -> Result<String> {
    let mut raw = [0u8; ID_LEN];
    getrandom::fill(&mut raw).map_err(|e| Error::Backend(format!("csprng: {e}")))?;
    Ok(raw
        .iter()
        .map(|b| ALPHABET[usize::from(*b) % ALPHABET.len()] as char)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_has_fixed_length_and_alphabet() {
        let id = generate_container_id().unwrap();
        assert_eq!(id.len(), ID_LEN);
        assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn ids_are_unique_in_practice() {
        let a = generate_container_id().unwrap();
        let b = generate_container_id().unwrap();
        assert_ne!(a, b);
    }
}
