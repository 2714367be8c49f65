//! Filesystem and process surface
//!
//! The only part of the engine that touches the OS: unique temp paths under
//! the scratch directory, the external compiler spawn, and shared-object
//! loading. Everything above this layer works with paths and results.

pub mod cc;
pub mod loader;

use std::path::{Path, PathBuf};

/// Namespace prefix for per-unit artifacts (`.c`, `.so`)
pub const UNIT_PREFIX: &str = "_jit";
/// Namespace prefix for the precompiled header
pub const PCH_PREFIX: &str = "_jit_h";
/// Precompiled-header extension
pub const PCH_SUFFIX: &str = ".h.gch";

/// Build a scratch path unique to this process and id:
/// `<dir>/<prefix>p<pid>u<id><suffix>`
pub fn temp_path(dir: &Path, prefix: &str, id: u64, suffix: &str) -> PathBuf {
    dir.join(format!("{}p{}u{}{}", prefix, std::process::id(), id, suffix))
}

/// Remove an intermediate file, keeping it when `save_temps` asks for that.
/// Removal failures are ignored; a stray temp file is not worth failing a
/// compile over.
pub fn remove_temp(path: &Path, save_temps: bool) {
    if !save_temps {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path_format() {
        let p = temp_path(Path::new("/tmp"), UNIT_PREFIX, 7, ".c");
        let name = p.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, format!("_jitp{}u7.c", std::process::id()));
        assert_eq!(p.parent().unwrap(), Path::new("/tmp"));
    }

    #[test]
    fn test_temp_paths_differ_by_id() {
        let dir = Path::new("/tmp");
        let a = temp_path(dir, UNIT_PREFIX, 1, ".so");
        let b = temp_path(dir, UNIT_PREFIX, 2, ".so");
        assert_ne!(a, b);
    }

    #[test]
    fn test_pch_path_shape() {
        let p = temp_path(Path::new("/tmp"), PCH_PREFIX, 0, PCH_SUFFIX);
        let name = p.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("_jit_hp"));
        assert!(name.ends_with(".h.gch"));
    }

    #[test]
    fn test_remove_temp_honors_save_temps() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join("keep.c");
        let drop = dir.path().join("drop.c");
        std::fs::write(&keep, "x").unwrap();
        std::fs::write(&drop, "x").unwrap();

        remove_temp(&keep, true);
        remove_temp(&drop, false);

        assert!(keep.exists());
        assert!(!drop.exists());
    }

    #[test]
    fn test_remove_temp_missing_file_is_quiet() {
        remove_temp(Path::new("/nonexistent/never.c"), false);
    }
}
