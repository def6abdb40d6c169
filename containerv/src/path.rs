//! Path normalization for container-relative paths.
//!
//! Every caller-supplied path that is joined to a bundle rootfs goes
//! through [`normalize`] first, so a hostile `..` can never escape the
//! bundle directory.

use crate::{Error, Result};

/// Normalizes a container-relative path.
///
/// Strips the leading `/`, collapses duplicate separators, drops `.`
/// segments, and rejects any path containing a `..` segment.
pub fn normalize(path: &str) -> Result<String> {
    let mut segments = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => return Err(Error::InvalidPath(path.to_owned())),
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_slash() {
        assert_eq!(normalize("/dev/pts").unwrap(), "dev/pts");
    }

    #[test]
    fn collapses_duplicate_separators() {
        assert_eq!(normalize("//etc///hosts").unwrap(), "etc/hosts");
    }

    #[test]
    fn drops_current_dir_segments() {
        assert_eq!(normalize("/./etc/./resolv.conf").unwrap(), "etc/resolv.conf");
    }

    #[test]
    fn rejects_parent_segments() {
        assert!(normalize("/etc/../../../root").is_err());
        assert!(normalize("..").is_err());
        assert!(normalize("a/../b").is_err());
    }

    #[test]
    fn empty_normalizes_to_empty() {
        assert_eq!(normalize("/").unwrap(), "");
    }
}
