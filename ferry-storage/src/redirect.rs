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

use ferry_common::{
    error::Result,
    spawn::{SpawnHandle, Spawner},
};
use url::Url;

use crate::store::{CacheLimits, LruFileStore, LruFileStoreConfig};

/// Memo of single-hop redirects, `from -> to`.
///
/// Records are written under a dedicated content tag, and the payload is the target URL. Multi-hop walks are the
/// caller's business.
#[derive(Debug, Clone)]
pub struct RedirectCache {
    store: LruFileStore,
}

impl RedirectCache {
    /// Store name, also the subdirectory of the cache directory.
    pub const NAME: &'static str = "redirect_cache";
    /// Content tag of redirect records.
    pub const CONTENT_TAG: &'static str = "redirect";

    /// Open the redirect cache under `dir`.
    pub async fn open(dir: impl AsRef<Path>, limits: CacheLimits, spawner: Spawner) -> Result<Self> {
        let store = LruFileStore::open(LruFileStoreConfig::new(dir, Self::NAME).with_limits(limits), spawner).await?;
        Ok(Self { store })
    }

    /// The backing store.
    pub fn store(&self) -> &LruFileStore {
        &self.store
    }

    /// Look up the memoized redirect target of `from`.
    ///
    /// Storage failures and targets that do not parse are logged and read as a miss.
    pub async fn get_redirect(&self, from: &Url) -> Option<Url> {
        let reader = match self.store.get(from.as_str(), Some(Self::CONTENT_TAG)).await {
            Ok(reader) => reader?,
            Err(e) => {
                tracing::warn!(%from, ?e, "[redirect cache]: lookup failed, treat as miss");
                return None;
            }
        };
        let bytes = match reader.read_to_bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(%from, ?e, "[redirect cache]: read failed, treat as miss");
                return None;
            }
        };

        match std::str::from_utf8(&bytes).ok().map(Url::parse) {
            Some(Ok(to)) => Some(to),
            _ => {
                tracing::debug!(%from, "[redirect cache]: malformed redirect target, treat as miss");
                None
            }
        }
    }

    /// Memoize `from -> to`. Failures are logged and otherwise ignored.
    pub async fn put_redirect(&self, from: &Url, to: &Url) {
        match self
            .store
            .put(from.as_str(), Some(Self::CONTENT_TAG), to.as_str())
            .await
        {
            Ok(true) => tracing::trace!(%from, %to, "[redirect cache]: memoized"),
            Ok(false) => {}
            Err(e) => tracing::warn!(%from, %to, ?e, "[redirect cache]: cannot memoize redirect"),
        }
    }

    /// Delete every memoized redirect. See [`LruFileStore::clear`].
    pub async fn clear(&self) -> Result<SpawnHandle<()>> {
        self.store.clear().await
    }
}
