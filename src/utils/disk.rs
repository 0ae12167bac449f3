use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percentage: f32,
    pub available: bool,
}

/// Best-effort free space query used by the compression preflight.
///
/// `None` means the platform can't answer; callers treat that as "enough".
pub trait SpaceQuery: Send + Sync {
    fn available_space(&self, path: &Path) -> Option<u64>;
}

/// Asks the filesystem holding `path` through `fs2`
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSpaceQuery;

impl SpaceQuery for FsSpaceQuery {
    fn available_space(&self, path: &Path) -> Option<u64> {
        fs2::available_space(path).ok()
    }
}

/// Directory whose filesystem will receive `target`
pub fn target_dir(target: &Path) -> &Path {
    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

pub fn get_path_stats(path: &Path) -> DiskStats {
    let (total, free) = match (fs2::total_space(path), fs2::available_space(path)) {
        (Ok(total), Ok(free)) => (total, free),
        _ => return DiskStats::default(),
    };

    let used = total.saturating_sub(free);
    let percentage = if total > 0 {
        (used as f32 / total as f32) * 100.0
    } else {
        0.0
    };

    DiskStats {
        total,
        used,
        free,
        percentage,
        available: true,
    }
}
