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

use std::path::Path;

use bytes::Bytes;
use ferry_common::spawn::Spawner;
use ferry_storage::{CacheLimits, LruFileStore, LruFileStoreConfig};
use itertools::Itertools;
use tempfile::tempdir;
use tokio::io::AsyncWriteExt;

async fn open(dir: &Path, limits: CacheLimits) -> LruFileStore {
    LruFileStore::open(
        LruFileStoreConfig::new(dir, "images").with_limits(limits),
        Spawner::current(),
    )
    .await
    .unwrap()
}

async fn read(store: &LruFileStore, key: &str, tag: Option<&str>) -> Option<Bytes> {
    let reader = store.get(key, tag).await.unwrap()?;
    Some(reader.read_to_bytes().await.unwrap())
}

fn file_names(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .sorted()
        .collect_vec()
}

#[test_log::test(tokio::test)]
async fn test_put_then_get_with_tags() {
    let dir = tempdir().unwrap();
    let store = open(dir.path(), CacheLimits::default()).await;

    let key = "https://cdn.example/img1.png";
    store.put(key, None, [0x01u8, 0x02, 0x03]).await.unwrap();

    assert_eq!(read(&store, key, None).await, Some(Bytes::from_static(&[0x01, 0x02, 0x03])));
    assert_eq!(read(&store, key, Some("v2")).await, None);
}

#[test_log::test(tokio::test)]
async fn test_tag_isolation() {
    let dir = tempdir().unwrap();
    let store = open(dir.path(), CacheLimits::default()).await;

    store.put("k", Some("v1"), b"one").await.unwrap();
    assert_eq!(read(&store, "k", Some("v1")).await, Some(Bytes::from_static(b"one")));
    assert_eq!(read(&store, "k", Some("v2")).await, None);
    assert_eq!(read(&store, "k", None).await, None);

    // The record of a key is shared by all tags, the latest write wins.
    store.put("k", Some("v2"), b"two").await.unwrap();
    assert_eq!(read(&store, "k", Some("v1")).await, None);
    assert_eq!(read(&store, "k", Some("v2")).await, Some(Bytes::from_static(b"two")));
}

#[test_log::test(tokio::test)]
async fn test_storage_name_collision_is_miss() {
    let dir = tempdir().unwrap();
    let store = open(dir.path(), CacheLimits::default()).await;

    store.put("other", None, b"payload").await.unwrap();
    std::fs::rename(store.record_path("other"), store.record_path("k")).unwrap();

    assert_eq!(read(&store, "k", None).await, None);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_quota_convergence() {
    const PAYLOAD: usize = 1000;

    let dir = tempdir().unwrap();
    let limits = CacheLimits::default().with_max_bytes(8 * 1024).with_max_files(6);
    let store = open(dir.path(), limits).await;

    let writes = (0..64)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.put(&format!("key-{i}"), None, vec![i as u8; PAYLOAD]).await.unwrap() })
        })
        .collect_vec();
    for write in writes {
        write.await.unwrap();
    }

    let usage = store.usage().await.unwrap();
    assert!(usage.bytes <= limits.max_bytes, "{usage:?}");
    assert!(usage.files <= limits.max_files, "{usage:?}");
    assert!(usage.files > 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_writers_publish_one_complete_record() {
    let dir = tempdir().unwrap();
    let store = open(dir.path(), CacheLimits::default()).await;

    let writes = (0..16u8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.put("k", None, vec![i; 4096]).await.unwrap() })
        })
        .collect_vec();
    for write in writes {
        write.await.unwrap();
    }

    let value = read(&store, "k", None).await.unwrap();
    assert_eq!(value.len(), 4096);
    assert!(value.iter().all_equal());

    // No buffer is left behind.
    store.wait_for_trim().await;
    assert_eq!(file_names(store.dir()), vec![ferry_storage::storage_name("k")]);
}

#[test_log::test(tokio::test)]
async fn test_clear_discards_records_and_inflight_writes() {
    let dir = tempdir().unwrap();
    let store = open(dir.path(), CacheLimits::default()).await;

    store.put("a", None, b"a").await.unwrap();
    store.put("b", None, b"b").await.unwrap();

    let mut writer = store.open_write_stream("c", None).await.unwrap();
    writer.write_all(b"c").await.unwrap();

    store.clear().await.unwrap().await.unwrap();
    assert!(!writer.close().await.unwrap());

    assert_eq!(read(&store, "a", None).await, None);
    assert_eq!(read(&store, "b", None).await, None);
    assert_eq!(read(&store, "c", None).await, None);
    assert!(file_names(store.dir()).is_empty());

    // Writes opened after the clear are published as usual.
    store.put("d", None, b"d").await.unwrap();
    assert_eq!(read(&store, "d", None).await, Some(Bytes::from_static(b"d")));
}

#[test_log::test(tokio::test)]
async fn test_reopen_deletes_stale_buffers() {
    let dir = tempdir().unwrap();
    {
        let store = open(dir.path(), CacheLimits::default()).await;
        store.put("k", None, b"kept").await.unwrap();
        store.wait_for_trim().await;
        std::fs::write(store.dir().join("buffer12"), b"crashed write").unwrap();
    }

    let store = open(dir.path(), CacheLimits::default()).await;
    assert_eq!(file_names(store.dir()), vec![ferry_storage::storage_name("k")]);
    assert_eq!(read(&store, "k", None).await, Some(Bytes::from_static(b"kept")));
}

#[test_log::test(tokio::test)]
async fn test_reader_survives_eviction() {
    let dir = tempdir().unwrap();
    let store = open(dir.path(), CacheLimits::default()).await;

    store.put("k", None, b"still readable").await.unwrap();
    let reader = store.get("k", None).await.unwrap().unwrap();
    store.clear().await.unwrap().await.unwrap();

    assert_eq!(reader.read_to_bytes().await.unwrap(), Bytes::from_static(b"still readable"));
}
