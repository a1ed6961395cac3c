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

use bytes::Bytes;
use ferry_common::{
    error::Result,
    spawn::{SpawnHandle, Spawner},
};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::store::{CacheLimits, CacheReader, InterceptStream, LruFileStore, LruFileStoreConfig};

/// Host allow-list of the response cache.
///
/// A host is trusted if it ends with `primary_suffix`, or if it both starts with `short_prefix` and ends with
/// `secondary_suffix`. An empty pattern never matches on its own, [`TrustedHosts::any`] trusts every host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedHosts {
    /// Trusted host suffix, e.g. `.cdn.example`.
    pub primary_suffix: String,
    /// Prefix of the short form of trusted hosts.
    pub short_prefix: String,
    /// Suffix of the short form of trusted hosts.
    pub secondary_suffix: String,
    #[serde(default)]
    any: bool,
}

impl TrustedHosts {
    /// Create an allow-list.
    pub fn new(
        primary_suffix: impl Into<String>,
        short_prefix: impl Into<String>,
        secondary_suffix: impl Into<String>,
    ) -> Self {
        Self {
            primary_suffix: primary_suffix.into(),
            short_prefix: short_prefix.into(),
            secondary_suffix: secondary_suffix.into(),
            any: false,
        }
    }

    /// Trust every host.
    pub fn any() -> Self {
        Self {
            any: true,
            ..Default::default()
        }
    }

    /// Returns `true` if `host` may be cached.
    pub fn is_trusted_host(&self, host: &str) -> bool {
        if self.any {
            return true;
        }
        if !self.primary_suffix.is_empty() && host.ends_with(&self.primary_suffix) {
            return true;
        }
        !self.short_prefix.is_empty()
            && !self.secondary_suffix.is_empty()
            && host.starts_with(&self.short_prefix)
            && host.ends_with(&self.secondary_suffix)
    }

    /// Returns `true` if the resource at `url` may be cached.
    pub fn is_trusted(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| self.is_trusted_host(host))
    }
}

/// Fetched payloads of trusted hosts, keyed by URL.
///
/// Storage failures never leave this facade: they are logged and read as a miss, or as "not cached" on the write
/// side.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    store: LruFileStore,
    trusted: TrustedHosts,
}

impl ResponseCache {
    /// Store name, also the subdirectory of the cache directory.
    pub const NAME: &'static str = "response_cache";

    /// Open the response cache under `dir`.
    pub async fn open(
        dir: impl AsRef<std::path::Path>,
        limits: CacheLimits,
        trusted: TrustedHosts,
        spawner: Spawner,
    ) -> Result<Self> {
        let store = LruFileStore::open(LruFileStoreConfig::new(dir, Self::NAME).with_limits(limits), spawner).await?;
        Ok(Self { store, trusted })
    }

    /// The host allow-list.
    pub fn trusted_hosts(&self) -> &TrustedHosts {
        &self.trusted
    }

    /// The backing store.
    pub fn store(&self) -> &LruFileStore {
        &self.store
    }

    /// Look up the cached payload of `url`. Untrusted hosts always miss.
    pub async fn get(&self, url: &Url) -> Option<CacheReader> {
        if !self.trusted.is_trusted(url) {
            return None;
        }
        match self.store.get(url.as_str(), None).await {
            Ok(reader) => reader,
            Err(e) => {
                tracing::warn!(%url, ?e, "[response cache]: lookup failed, treat as miss");
                None
            }
        }
    }

    /// Wrap `source`, the response body of `url`, so that it is cached as it is consumed.
    ///
    /// Bodies of untrusted hosts, or bodies whose record cannot be opened, pass through uncached.
    pub async fn intercept<S>(&self, url: &Url, source: S) -> InterceptStream<S>
    where
        S: Stream<Item = Result<Bytes>>,
    {
        if !self.trusted.is_trusted(url) {
            return InterceptStream::passthrough(source);
        }
        match self.store.open_write_stream(url.as_str(), None).await {
            Ok(writer) => InterceptStream::new(source, Some(writer)),
            Err(e) => {
                tracing::warn!(%url, ?e, "[response cache]: cannot open record, pass through");
                InterceptStream::passthrough(source)
            }
        }
    }

    /// Delete every cached payload. See [`LruFileStore::clear`].
    pub async fn clear(&self) -> Result<SpawnHandle<()>> {
        self.store.clear().await
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{stream, TryStreamExt};
    use tempfile::tempdir;

    use super::*;

    fn trusted() -> TrustedHosts {
        TrustedHosts::new(".cdn.example", "img", ".example.net")
    }

    #[test]
    fn test_trusted_hosts() {
        let trusted = trusted();
        assert!(trusted.is_trusted_host("a.cdn.example"));
        assert!(trusted.is_trusted_host("img7.example.net"));
        assert!(!trusted.is_trusted_host("www.example.net"));
        assert!(!trusted.is_trusted_host("cdn.example.org"));

        assert!(trusted.is_trusted(&Url::parse("https://a.cdn.example/x.png").unwrap()));
        assert!(!trusted.is_trusted(&Url::parse("data:text/plain,hello").unwrap()));

        assert!(!TrustedHosts::default().is_trusted_host("a.cdn.example"));
        assert!(TrustedHosts::any().is_trusted_host("anything.at.all"));
    }

    #[test_log::test(tokio::test)]
    async fn test_untrusted_hosts_are_not_cached() {
        let dir = tempdir().unwrap();
        let cache = ResponseCache::open(dir.path(), CacheLimits::default(), trusted(), Spawner::current())
            .await
            .unwrap();
        let url = Url::parse("https://evil.example/x.png").unwrap();

        let source = stream::iter(vec![Ok(Bytes::from_static(b"payload"))]);
        let mut body = cache.intercept(&url, source).await;
        assert!(!body.is_caching());
        while body.try_next().await.unwrap().is_some() {}
        assert!(!body.close().await.unwrap());

        // Even a record written behind the facade's back is not served.
        cache.store().put(url.as_str(), None, b"payload").await.unwrap();
        assert!(cache.get(&url).await.is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_trusted_hosts_are_cached() {
        let dir = tempdir().unwrap();
        let cache = ResponseCache::open(dir.path(), CacheLimits::default(), trusted(), Spawner::current())
            .await
            .unwrap();
        let url = Url::parse("https://a.cdn.example/x.png").unwrap();

        let source = stream::iter(vec![Ok(Bytes::from_static(b"pay")), Ok(Bytes::from_static(b"load"))]);
        let mut body = cache.intercept(&url, source).await;
        assert!(body.is_caching());
        while body.try_next().await.unwrap().is_some() {}
        assert!(body.close().await.unwrap());

        let reader = cache.get(&url).await.unwrap();
        assert_eq!(reader.read_to_bytes().await.unwrap(), Bytes::from_static(b"payload"));
    }
}
