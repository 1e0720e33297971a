// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmkv contributors
//
// Deterministic segment naming (SPEC_FULL.md §6, §6A.1): independent
// processes must attach to the same segment without coordinating a name out
// of band, so the name is derived from the inode of a well-known file
// rather than chosen by the caller.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;

use crate::shm_name::make_shm_name;

fn lock_file_path() -> PathBuf {
    std::env::temp_dir().join("shmkv.lock")
}

#[cfg(unix)]
fn file_identity(path: &std::path::Path) -> io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    let file = OpenOptions::new().create(true).write(true).open(path)?;
    Ok(file.metadata()?.ino())
}

#[cfg(windows)]
fn file_identity(path: &std::path::Path) -> io::Result<u64> {
    use std::os::windows::fs::MetadataExt;
    let file = OpenOptions::new().create(true).write(true).open(path)?;
    Ok(file.metadata()?.file_index().unwrap_or(0))
}

/// Derive the single host-wide segment name every process should attach to.
pub fn segment_name() -> io::Result<String> {
    let path = lock_file_path();
    let inode = file_identity(&path)?;
    Ok(make_shm_name(&format!("shmkv-{inode:016x}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_name_is_deterministic_across_calls() {
        let a = segment_name().unwrap();
        let b = segment_name().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn segment_name_has_shm_prefix() {
        let name = segment_name().unwrap();
        assert!(name.starts_with('/'));
        assert!(name.contains("shmkv"));
    }
}
