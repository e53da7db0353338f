use std::path::{Path, PathBuf};

use sysinfo::Disks;

use crate::artifacts::DiskSpaceSample;
use crate::error::SpaceQueryError;

/// Source of free-space readings for the volume holding a path.
pub trait SpaceProbe {
    fn free_bytes(&self, path: &Path) -> Result<u64, SpaceQueryError>;
}

/// Reads free space from the mounted volumes reported by the OS.
pub struct SysinfoProbe {
}

impl SysinfoProbe {
    pub fn new() -> Self {
        SysinfoProbe {  }
    }
}

impl SpaceProbe for SysinfoProbe {
    fn free_bytes(&self, path: &Path) -> Result<u64, SpaceQueryError> {
        let resolved = resolve_existing(path)?;
        let disks = Disks::new_with_refreshed_list();
        let available = disks
            .list()
            .iter()
            .filter(|disk| resolved.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| disk.available_space());

        match available {
            Some(bytes) => Ok(bytes),
            None => Err(SpaceQueryError::NoVolume { path: resolved }),
        }
    }
}

/// The work dir may not exist yet; measure the closest ancestor that does.
fn resolve_existing(path: &Path) -> Result<PathBuf, SpaceQueryError> {
    let absolute = if path.is_absolute() {
        PathBuf::from(path)
    } else {
        std::env::current_dir()
            .map_err(|source| SpaceQueryError::Resolve { path: PathBuf::from(path), source })?
            .join(path)
    };

    let existing = absolute
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or(absolute.as_path());

    existing
        .canonicalize()
        .map_err(|source| SpaceQueryError::Resolve { path: PathBuf::from(existing), source })
}

/// Admission gate consulted before every download attempt. Readings are
/// never cached.
pub struct DiskSpaceGuard {
    probe: Box<dyn SpaceProbe>,
}

impl DiskSpaceGuard {
    pub fn new(probe: Box<dyn SpaceProbe>) -> Self {
        DiskSpaceGuard { probe }
    }

    pub fn sample(&self, path: &Path) -> Result<DiskSpaceSample, SpaceQueryError> {
        Ok(DiskSpaceSample { free_bytes: self.probe.free_bytes(path)? })
    }

    pub fn free_space_gb(&self, path: &Path) -> Result<f64, SpaceQueryError> {
        Ok(self.sample(path)?.gigabytes())
    }

    pub fn ensure_space(&self, path: &Path, min_gb: f64) -> Result<bool, SpaceQueryError> {
        Ok(self.free_space_gb(path)? >= min_gb)
    }
}

impl Default for DiskSpaceGuard {
    fn default() -> Self {
        DiskSpaceGuard::new(Box::new(SysinfoProbe::new()))
    }
}
