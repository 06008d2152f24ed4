//! Atomic file replacement
//!
//! Compaction rewrites a log into a temporary file and then swaps it in
//! place of the active one.
//!
//! # Pattern
//!
//! 1. Write the live records to `<name>.tmp` and sync it
//! 2. Close the temporary file, then close the active file
//! 3. Rename the temporary file over the active one
//! 4. Reopen the active file (even if the rename failed)
//!
//! Both files are closed before the rename since some platforms refuse to
//! rename over an open file. A crash leaves either the old file or the new
//! file in place, plus possibly a stale `.tmp` removed at next startup.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::StoreResult;

/// Extension of temporary files written during compaction
pub const TEMP_EXTENSION: &str = "tmp";

/// Path of the temporary file used to rewrite `path`
pub fn temp_path_for(path: &Path) -> PathBuf {
    path.with_extension(TEMP_EXTENSION)
}

/// Swap a fully written temporary file in place of the active file.
///
/// Returns the reopened active file (if reopening worked) together with the
/// outcome of the swap. The temporary file is removed in every case.
pub fn swap_files<F>(
    temp: File,
    temp_path: &Path,
    active: File,
    active_path: &Path,
    reopen: F,
) -> (Option<File>, StoreResult<()>)
where
    F: FnOnce(&Path) -> StoreResult<File>,
{
    drop(temp);
    drop(active);

    let renamed = fs::rename(temp_path, active_path);
    if renamed.is_err() {
        if let Err(e) = fs::remove_file(temp_path) {
            tracing::warn!(path = %temp_path.display(), error = %e, "unable to remove compaction file");
        }
    }

    match reopen(active_path) {
        Ok(file) => (Some(file), renamed.map_err(Into::into)),
        Err(reopen_err) => match renamed {
            Err(e) => (None, Err(e.into())),
            Ok(()) => (None, Err(reopen_err)),
        },
    }
}

/// Delete `subs.tmp` / `clients.tmp` files left by a compaction that did
/// not reach its swap, returning how many were removed.
///
/// Only safe while no store has `dir` open: a running store's compaction
/// writes the same names.
pub fn cleanup_temp_files<P: AsRef<Path>>(dir: P) -> io::Result<usize> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_temp = path.extension().is_some_and(|ext| ext == TEMP_EXTENSION);
        if is_temp && path.is_file() {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn open_rw(path: &Path) -> StoreResult<File> {
        Ok(fs::OpenOptions::new().read(true).append(true).open(path)?)
    }

    #[test]
    fn test_swap_replaces_active_content() {
        let temp_dir = TempDir::new().unwrap();
        let active_path = temp_dir.path().join("subs.dat");
        let temp_path = temp_path_for(&active_path);

        fs::write(&active_path, "old content").unwrap();
        let active = open_rw(&active_path).unwrap();
        let mut temp = File::create(&temp_path).unwrap();
        temp.write_all(b"new content").unwrap();

        let (file, result) = swap_files(temp, &temp_path, active, &active_path, open_rw);
        result.unwrap();
        assert!(file.is_some());
        assert_eq!(fs::read_to_string(&active_path).unwrap(), "new content");
        assert!(!temp_path.exists());
    }

    #[test]
    fn test_swap_reopens_active_when_rename_fails() {
        let temp_dir = TempDir::new().unwrap();
        let active_path = temp_dir.path().join("subs.dat");
        let temp_path = temp_path_for(&active_path);

        fs::write(&active_path, "old content").unwrap();
        let active = open_rw(&active_path).unwrap();
        let temp = File::create(&temp_path).unwrap();
        // Make the rename fail: the temporary file is gone.
        fs::remove_file(&temp_path).unwrap();

        let (file, result) = swap_files(temp, &temp_path, active, &active_path, open_rw);
        assert!(result.is_err());
        assert!(file.is_some());
        assert_eq!(fs::read_to_string(&active_path).unwrap(), "old content");
    }

    #[test]
    fn test_temp_path_for() {
        assert_eq!(temp_path_for(Path::new("/x/subs.dat")), PathBuf::from("/x/subs.tmp"));
    }

    #[test]
    fn test_cleanup_temp_files() {
        let temp_dir = TempDir::new().unwrap();

        fs::write(temp_dir.path().join("subs.tmp"), "temp1").unwrap();
        fs::write(temp_dir.path().join("clients.tmp"), "temp2").unwrap();
        fs::write(temp_dir.path().join("subs.dat"), "keep").unwrap();

        let cleaned = cleanup_temp_files(temp_dir.path()).unwrap();
        assert_eq!(cleaned, 2);

        assert!(!temp_dir.path().join("subs.tmp").exists());
        assert!(!temp_dir.path().join("clients.tmp").exists());
        assert!(temp_dir.path().join("subs.dat").exists());
    }

    #[test]
    fn test_cleanup_skips_channel_dirs_and_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        // A channel may legitimately be named like a temp file.
        fs::create_dir(temp_dir.path().join("orders.tmp")).unwrap();
        assert_eq!(cleanup_temp_files(temp_dir.path()).unwrap(), 0);
        assert!(temp_dir.path().join("orders.tmp").is_dir());

        assert_eq!(cleanup_temp_files(temp_dir.path().join("missing")).unwrap(), 0);
    }
}
