// Copyright 2026 ferry Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Buffer files hold writes in progress.
//!
//! A buffer file is named `buffer<N>`, where `N` comes from a process-wide counter, so two writers never share a
//! buffer. Only the writer that allocated a buffer touches it, until it is renamed into a record or deleted.

use std::{
    fs::{read_dir, remove_file},
    io::ErrorKind as IoErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

pub const BUFFER_FILE_PREFIX: &str = "buffer";

static BUFFER_INDEX: AtomicU64 = AtomicU64::new(0);

/// Allocate a fresh buffer file path under `dir`.
pub fn new_buffer_path(dir: &Path) -> PathBuf {
    let index = BUFFER_INDEX.fetch_add(1, Ordering::Relaxed) + 1;
    dir.join(format!("{BUFFER_FILE_PREFIX}{index}"))
}

pub fn is_buffer_name(name: &str) -> bool {
    name.starts_with(BUFFER_FILE_PREFIX)
}

/// Delete every buffer file under `dir`. Used on startup to drop writes interrupted by a crash.
///
/// Returns the count of deleted buffers.
pub fn delete_all(dir: &Path) -> std::io::Result<usize> {
    let mut deleted = 0;
    for entry in read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if !is_buffer_name(&name.to_string_lossy()) {
            continue;
        }
        match remove_file(entry.path()) {
            Ok(()) => deleted += 1,
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => tracing::warn!(?e, path = ?entry.path(), "[buffer]: cannot delete stale buffer file"),
        }
    }
    Ok(deleted)
}

/// Remove a buffer file, ignoring a buffer that is already gone.
pub fn discard(path: &Path) {
    match remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == IoErrorKind::NotFound => {}
        Err(e) => tracing::warn!(?e, ?path, "[buffer]: cannot delete buffer file"),
    }
}

#[cfg(test)]
mod tests {
    use std::fs::write;

    use itertools::Itertools;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_buffer_names_are_unique() {
        let dir = tempdir().unwrap();
        let paths = (0..64).map(|_| new_buffer_path(dir.path())).collect_vec();
        assert_eq!(paths.iter().unique().count(), 64);
        assert!(paths
            .iter()
            .all(|p| is_buffer_name(&p.file_name().unwrap().to_string_lossy())));
    }

    #[test]
    fn test_delete_all_keeps_records() {
        let dir = tempdir().unwrap();
        write(dir.path().join("buffer1"), b"partial").unwrap();
        write(dir.path().join("buffer42"), b"partial").unwrap();
        write(dir.path().join("0a1b2c"), b"record").unwrap();

        assert_eq!(delete_all(dir.path()).unwrap(), 2);

        let left = read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect_vec();
        assert_eq!(left, vec!["0a1b2c".to_string()]);
    }
}
