//! Locate export.pdb and ANLZ files under an export root

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

/// Conventional location of the database below a USB root
const DATABASE_PATH: &[&str] = &["PIONEER", "rekordbox", "export.pdb"];

const DATABASE_NAME: &str = "export.pdb";

/// Find the database: `root` itself if it is a file, the conventional path,
/// or the first export.pdb found anywhere below `root`.
pub fn find_database(root: &Path) -> Option<PathBuf> {
    if root.is_file() {
        return Some(root.to_path_buf());
    }

    let conventional: PathBuf = DATABASE_PATH.iter().fold(root.to_path_buf(), |p, part| p.join(part));
    if conventional.is_file() {
        return Some(conventional);
    }

    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .find(|e| e.file_name().eq_ignore_ascii_case(DATABASE_NAME))
        .map(|e| e.into_path())
}

/// All analysis files below `root`, sorted by path
pub fn find_sidecars(root: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_sidecar(e.path()))
        .map(|e| e.into_path())
        .collect();
    found.sort();
    debug!(count = found.len(), "found analysis files");
    found
}

pub fn is_sidecar(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_uppercase());

    matches!(ext.as_deref(), Some("DAT" | "EXT" | "2EX"))
}
