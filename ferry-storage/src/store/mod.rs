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

//! A size- and count-bounded LRU store of records in a single directory.
//!
//! Each record is one file, named by the hex SHA-256 digest of its key. Writes go to private buffer files first and
//! are renamed into place on close, so a reader only ever sees complete records. After each publish a background trim
//! evicts the least recently used records until the directory fits the limits again.

mod buffer;
mod header;
mod intercept;
mod reader;
mod writer;

use std::{
    fmt::Display,
    fs::{read_dir, remove_file, rename, File as StdFile, OpenOptions},
    io::{ErrorKind as IoErrorKind, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use ferry_common::{
    asyncify::asyncify_with_spawner,
    error::{Error, ErrorKind, Result},
    spawn::{SpawnHandle, Spawner},
};
use futures_core::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{fs::File, io::AsyncWriteExt, sync::Notify};

pub use self::{intercept::InterceptStream, reader::CacheReader, writer::CacheWriter};
use self::header::RecordHeader;

/// File name of the record of `key`: the lowercase hex SHA-256 digest of its UTF-8 bytes.
pub fn storage_name(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Size and count bounds of a store.
///
/// The bounds are enforced eventually: the directory may exceed them briefly until the next trim completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLimits {
    /// Upper bound of the summed record file sizes, headers included.
    pub max_bytes: u64,
    /// Upper bound of the record file count.
    pub max_files: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_bytes: Self::DEFAULT_MAX_BYTES,
            max_files: Self::DEFAULT_MAX_FILES,
        }
    }
}

impl CacheLimits {
    /// 1 MiB.
    pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024;
    /// 1024 files.
    pub const DEFAULT_MAX_FILES: usize = 1024;

    /// Set the byte bound.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Set the file count bound.
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }
}

/// Config of a [`LruFileStore`].
#[derive(Debug, Clone)]
pub struct LruFileStoreConfig {
    /// Parent directory. The store lives in `<dir>/<name>`.
    pub dir: PathBuf,
    /// Name of the store, also its subdirectory name.
    pub name: String,
    /// Size and count bounds.
    pub limits: CacheLimits,
}

impl LruFileStoreConfig {
    /// Create a config with default limits.
    pub fn new(dir: impl AsRef<Path>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().into(),
            name: name.into(),
            limits: CacheLimits::default(),
        }
    }

    /// Set the size and count bounds.
    pub fn with_limits(mut self, limits: CacheLimits) -> Self {
        self.limits = limits;
        self
    }

    fn verify(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) || self.name == "." || self.name == ".." {
            return Err(Error::new(ErrorKind::Config, "store name must be a plain directory name")
                .with_context("name", &self.name));
        }
        Ok(())
    }
}

/// Disk usage of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreUsage {
    /// Summed record file sizes.
    pub bytes: u64,
    /// Record file count.
    pub files: usize,
}

#[derive(Debug, Default)]
struct TrimState {
    running: bool,
    /// Set when a trim is requested while one is running.
    rerun: bool,
}

#[derive(Debug)]
struct StoreInner {
    name: String,
    dir: PathBuf,
    limits: CacheLimits,
    spawner: Spawner,

    /// Bumped by every clear. Buffers created under an older epoch are never published.
    clear_epoch: AtomicU64,

    trim: Mutex<TrimState>,
    trim_done: Notify,
}

/// Size- and count-bounded LRU store of `key -> bytes` records, backed by one directory.
///
/// Cloning is cheap, all clones share the same store.
#[derive(Debug, Clone)]
pub struct LruFileStore {
    inner: Arc<StoreInner>,
}

impl Display for LruFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LruFileStore {{ name: {}, dir: {} }}", self.inner.name, self.inner.dir.display())
    }
}

impl LruFileStore {
    /// Open the store at `<dir>/<name>`, creating the directory if needed.
    ///
    /// Buffer files left behind by an earlier process are deleted.
    pub async fn open(config: LruFileStoreConfig, spawner: Spawner) -> Result<Self> {
        config.verify()?;
        let dir = config.dir.join(&config.name);

        let stale = asyncify_with_spawner(&spawner, {
            let dir = dir.clone();
            move || {
                std::fs::create_dir_all(&dir)?;
                Ok(buffer::delete_all(&dir)?)
            }
        })
        .await
        .map_err(|e| e.with_context("dir", dir.display()))?;

        tracing::info!(name = %config.name, ?dir, stale, limits = ?config.limits, "[lru file store]: open");

        Ok(Self {
            inner: Arc::new(StoreInner {
                name: config.name,
                dir,
                limits: config.limits,
                spawner,
                clear_epoch: AtomicU64::new(0),
                trim: Mutex::new(TrimState::default()),
                trim_done: Notify::new(),
            }),
        })
    }

    /// Name of the store.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Directory of the store.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Size and count bounds of the store.
    pub fn limits(&self) -> CacheLimits {
        self.inner.limits
    }

    /// Look up the record of `key` under the content tag `tag`.
    ///
    /// Returns a reader positioned at the payload on hit. A missing record, an unreadable header, a record of another
    /// key sharing the storage name, or a content tag mismatch are all misses. A hit refreshes the record's last
    /// modified time.
    pub async fn get(&self, key: &str, tag: Option<&str>) -> Result<Option<CacheReader>> {
        let path = self.record_path(key);
        let file = asyncify_with_spawner(&self.inner.spawner, {
            let key = key.to_string();
            let tag = tag.map(str::to_string);
            move || open_record(&path, &key, tag.as_deref())
        })
        .await?;

        Ok(file.map(|file| CacheReader::new(key.to_string(), File::from_std(file))))
    }

    /// Start writing the record of `key` under the content tag `tag`.
    ///
    /// The record becomes visible only after [`CacheWriter::close`].
    pub async fn open_write_stream(&self, key: &str, tag: Option<&str>) -> Result<CacheWriter> {
        let header = RecordHeader::new(key, tag).encode()?;
        let epoch = self.inner.clear_epoch.load(Ordering::Acquire);
        let buffer = buffer::new_buffer_path(&self.inner.dir);

        let file = asyncify_with_spawner(&self.inner.spawner, {
            let buffer = buffer.clone();
            move || create_buffer(&buffer, &header)
        })
        .await?;

        Ok(CacheWriter::new(
            self.clone(),
            key.to_string(),
            buffer,
            epoch,
            File::from_std(file),
        ))
    }

    /// Write a whole record at once.
    ///
    /// Returns `true` if the record was published.
    pub async fn put(&self, key: &str, tag: Option<&str>, value: impl AsRef<[u8]>) -> Result<bool> {
        let mut writer = self.open_write_stream(key, tag).await?;
        writer.write_all(value.as_ref()).await?;
        writer.close().await
    }

    /// Wrap `source` so that every chunk it yields is also written to the untagged record of `key`.
    ///
    /// See [`InterceptStream`] for when the record gets published.
    pub async fn intercept_and_store<S>(&self, key: &str, source: S) -> Result<InterceptStream<S>>
    where
        S: Stream<Item = Result<Bytes>>,
    {
        let writer = self.open_write_stream(key, None).await?;
        Ok(InterceptStream::new(source, Some(writer)))
    }

    /// Delete every record present now.
    ///
    /// Writes still in progress are discarded when they close. Deletion runs in the background, the returned handle
    /// completes when it is done.
    pub async fn clear(&self) -> Result<SpawnHandle<()>> {
        let records = asyncify_with_spawner(&self.inner.spawner, {
            let dir = self.inner.dir.clone();
            move || Ok(list_records(&dir)?)
        })
        .await?;
        let epoch = self.inner.clear_epoch.fetch_add(1, Ordering::AcqRel) + 1;

        tracing::info!(name = %self.inner.name, records = records.len(), epoch, "[lru file store]: clear");

        Ok(self.inner.spawner.spawn_blocking(move || {
            for record in records {
                remove_record(&record.path);
            }
        }))
    }

    /// Wait until no trim is running or requested.
    pub async fn wait_for_trim(&self) {
        loop {
            let notified = self.inner.trim_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.inner.trim.lock().running {
                return;
            }
            notified.await;
        }
    }

    /// Disk usage of the records, measured after pending trims have finished.
    pub async fn usage(&self) -> Result<StoreUsage> {
        self.wait_for_trim().await;
        let records = asyncify_with_spawner(&self.inner.spawner, {
            let dir = self.inner.dir.clone();
            move || Ok(list_records(&dir)?)
        })
        .await?;
        Ok(StoreUsage {
            bytes: records.iter().map(|r| r.len).sum(),
            files: records.len(),
        })
    }

    /// Summed record file sizes, measured after pending trims have finished.
    pub async fn size_in_bytes(&self) -> Result<u64> {
        self.usage().await.map(|usage| usage.bytes)
    }

    /// Path of the record of `key`.
    pub fn record_path(&self, key: &str) -> PathBuf {
        self.inner.dir.join(storage_name(key))
    }

    /// Rename a closed buffer into place as the record of `key`.
    pub(crate) async fn publish(&self, buffer: PathBuf, key: &str, epoch: u64) -> Result<bool> {
        let target = self.record_path(key);
        let inner = self.inner.clone();

        let published = asyncify_with_spawner(&self.inner.spawner, move || {
            if inner.clear_epoch.load(Ordering::Acquire) != epoch {
                tracing::debug!(?buffer, "[lru file store]: buffer predates a clear, discard");
                buffer::discard(&buffer);
                return Ok(false);
            }
            match rename(&buffer, &target) {
                Ok(()) => Ok(true),
                Err(e) => {
                    tracing::debug!(?e, ?buffer, ?target, "[lru file store]: cannot rename buffer, discard");
                    buffer::discard(&buffer);
                    Ok(false)
                }
            }
        })
        .await?;

        if published {
            self.post_trim();
        }
        Ok(published)
    }

    /// Request a background trim. Requests made while a trim is running fold into one more pass.
    fn post_trim(&self) {
        {
            let mut trim = self.inner.trim.lock();
            if trim.running {
                trim.rerun = true;
                return;
            }
            trim.running = true;
        }

        let inner = self.inner.clone();
        drop(self.inner.spawner.spawn_blocking(move || run_trim(inner)));
    }
}

/// Resets the trim state and wakes waiters even if a trim pass panics.
struct TrimGuard {
    inner: Arc<StoreInner>,
    finished: bool,
}

impl Drop for TrimGuard {
    fn drop(&mut self) {
        if !self.finished {
            let mut trim = self.inner.trim.lock();
            trim.running = false;
            trim.rerun = false;
        }
        self.inner.trim_done.notify_waiters();
    }
}

fn run_trim(inner: Arc<StoreInner>) {
    let mut guard = TrimGuard {
        inner: inner.clone(),
        finished: false,
    };

    loop {
        match trim(&inner.dir, &inner.limits) {
            Ok(usage) => tracing::trace!(name = %inner.name, ?usage, "[lru file store]: trim done"),
            Err(e) => tracing::warn!(name = %inner.name, ?e, "[lru file store]: trim failed"),
        }

        let mut state = inner.trim.lock();
        if state.rerun {
            state.rerun = false;
            continue;
        }
        state.running = false;
        guard.finished = true;
        break;
    }
}

#[derive(Debug)]
struct RecordFile {
    name: String,
    path: PathBuf,
    len: u64,
    modified: SystemTime,
}

/// List the record files of `dir`, skipping buffers and anything that vanished while listing.
fn list_records(dir: &Path) -> std::io::Result<Vec<RecordFile>> {
    let mut records = vec![];
    for entry in read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(?e, ?dir, "[lru file store]: cannot read dir entry");
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().to_string();
        if buffer::is_buffer_name(&name) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(e) if e.kind() == IoErrorKind::NotFound => continue,
            Err(e) => {
                tracing::warn!(?e, %name, "[lru file store]: cannot stat record");
                continue;
            }
        };
        records.push(RecordFile {
            name,
            path: entry.path(),
            len: metadata.len(),
            modified: metadata.modified().unwrap_or(UNIX_EPOCH),
        });
    }
    Ok(records)
}

/// Evict least recently used records until `dir` fits `limits`.
///
/// Records are ordered by last modified time, ties broken by file name.
fn trim(dir: &Path, limits: &CacheLimits) -> std::io::Result<StoreUsage> {
    let mut records = list_records(dir)?;
    records.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));

    let mut usage = StoreUsage {
        bytes: records.iter().map(|r| r.len).sum(),
        files: records.len(),
    };

    for record in records {
        if usage.bytes <= limits.max_bytes && usage.files <= limits.max_files {
            break;
        }
        tracing::debug!(name = %record.name, len = record.len, "[lru file store]: evict");
        remove_record(&record.path);
        // Count the record as gone even if deleting failed, so one stuck file cannot stall the trim.
        usage.bytes -= record.len;
        usage.files -= 1;
    }

    Ok(usage)
}

fn remove_record(path: &Path) {
    match remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == IoErrorKind::NotFound => {}
        Err(e) => tracing::warn!(?e, ?path, "[lru file store]: cannot delete record"),
    }
}

fn open_record(path: &Path, key: &str, tag: Option<&str>) -> Result<Option<StdFile>> {
    let mut file = match StdFile::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io_error(e).with_context("path", path.display())),
    };

    let Some(header) = RecordHeader::decode(&mut file)? else {
        tracing::debug!(?path, "[lru file store]: unreadable record header, miss");
        return Ok(None);
    };
    if !header.matches(key, tag) {
        tracing::debug!(key, ?tag, found = ?header, "[lru file store]: record belongs to another key or tag, miss");
        return Ok(None);
    }

    if let Err(e) = file.set_modified(SystemTime::now()) {
        tracing::warn!(?e, ?path, "[lru file store]: cannot refresh record last modified time");
    }
    Ok(Some(file))
}

fn create_buffer(path: &Path, header: &[u8]) -> Result<StdFile> {
    buffer::discard(path);
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    if let Err(e) = file.write_all(header) {
        drop(file);
        buffer::discard(path);
        return Err(Error::io_error(e).with_context("path", path.display()));
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;

    async fn open(dir: &Path, limits: CacheLimits) -> LruFileStore {
        LruFileStore::open(
            LruFileStoreConfig::new(dir, "store").with_limits(limits),
            Spawner::current(),
        )
        .await
        .unwrap()
    }

    fn set_modified(path: &Path, secs: u64) {
        let file = StdFile::options().write(true).open(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
    }

    #[test]
    fn test_storage_name() {
        assert_eq!(
            storage_name(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(storage_name("a"), storage_name("a"));
        assert_ne!(storage_name("a"), storage_name("b"));
    }

    #[test]
    fn test_config_rejects_path_names() {
        for name in ["", "a/b", "..", "."] {
            let err = LruFileStoreConfig::new("/tmp", name).verify().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config);
        }
        LruFileStoreConfig::new("/tmp", "response_cache").verify().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_put_get() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), CacheLimits::default()).await;

        assert!(store.get("k", None).await.unwrap().is_none());
        assert!(store.put("k", None, b"hello").await.unwrap());

        let reader = store.get("k", None).await.unwrap().unwrap();
        assert_eq!(reader.key(), "k");
        assert_eq!(reader.read_to_bytes().await.unwrap(), Bytes::from_static(b"hello"));

        // Overwrite.
        assert!(store.put("k", None, b"world").await.unwrap());
        let reader = store.get("k", None).await.unwrap().unwrap();
        assert_eq!(reader.read_to_bytes().await.unwrap(), Bytes::from_static(b"world"));
    }

    #[test_log::test(tokio::test)]
    async fn test_writer_visible_only_after_close() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), CacheLimits::default()).await;

        let mut writer = store.open_write_stream("k", None).await.unwrap();
        writer.write_all(b"partial").await.unwrap();
        writer.flush().await.unwrap();
        assert!(store.get("k", None).await.unwrap().is_none());

        assert!(writer.close().await.unwrap());
        assert!(store.get("k", None).await.unwrap().is_some());
    }

    #[test_log::test(tokio::test)]
    async fn test_dropped_writer_leaves_nothing() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), CacheLimits::default()).await;

        let mut writer = store.open_write_stream("k", None).await.unwrap();
        writer.write_all(b"partial").await.unwrap();
        writer.abandon();

        assert!(store.get("k", None).await.unwrap().is_none());
        assert_eq!(read_dir(store.dir()).unwrap().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_corrupt_record_is_miss() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), CacheLimits::default()).await;

        std::fs::write(store.record_path("k"), b"\x07garbage").unwrap();
        assert!(store.get("k", None).await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_trim_evicts_least_recently_used() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), CacheLimits::default().with_max_files(2)).await;

        store.put("a", None, b"a").await.unwrap();
        store.put("b", None, b"b").await.unwrap();
        store.wait_for_trim().await;
        set_modified(&store.record_path("a"), 100);
        set_modified(&store.record_path("b"), 200);

        // A hit on `a` makes `b` the oldest.
        store.get("a", None).await.unwrap().unwrap();

        store.put("c", None, b"c").await.unwrap();
        store.wait_for_trim().await;

        assert!(store.get("a", None).await.unwrap().is_some());
        assert!(store.get("b", None).await.unwrap().is_none());
        assert!(store.get("c", None).await.unwrap().is_some());
        assert_eq!(store.usage().await.unwrap().files, 2);
    }

    #[test]
    fn test_trim_breaks_ties_by_name() {
        let dir = tempdir().unwrap();
        for name in ["b", "a", "c"] {
            std::fs::write(dir.path().join(name), b"xx").unwrap();
            set_modified(&dir.path().join(name), 1);
        }

        let usage = trim(dir.path(), &CacheLimits::default().with_max_files(1)).unwrap();
        assert_eq!(usage, StoreUsage { bytes: 2, files: 1 });
        assert!(dir.path().join("c").exists());
    }

    #[test_log::test(tokio::test)]
    async fn test_zero_limits_evict_everything() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), CacheLimits::default().with_max_bytes(0)).await;

        assert!(store.put("k", None, b"v").await.unwrap());
        assert_eq!(store.size_in_bytes().await.unwrap(), 0);
        assert!(store.get("k", None).await.unwrap().is_none());
    }
}
