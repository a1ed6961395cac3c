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

use std::{path::PathBuf, sync::Arc};

use ferry_common::{
    error::{Error, ErrorKind, Result},
    scheduler::WorkScheduler,
    spawn::Spawner,
};
use ferry_storage::{CacheLimits, RedirectCache, ResponseCache, TrustedHosts};

use crate::{
    coordinator::FetchCoordinator,
    decoder::{BytesDecoder, Decoder},
    transport::{ReqwestTransport, Transport},
};

/// Builder of a [`FetchCoordinator`].
pub struct FetchCoordinatorBuilder<D = BytesDecoder> {
    cache_dir: Option<PathBuf>,
    response_limits: CacheLimits,
    redirect_limits: CacheLimits,
    trusted_hosts: TrustedHosts,
    cache_read_concurrency: usize,
    download_concurrency: usize,
    max_redirect_hops: usize,
    spawner: Option<Spawner>,
    transport: Option<Arc<dyn Transport>>,
    decoder: D,
}

impl Default for FetchCoordinatorBuilder<BytesDecoder> {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchCoordinatorBuilder<BytesDecoder> {
    /// Default concurrency of the cache-read stage.
    pub const DEFAULT_CACHE_READ_CONCURRENCY: usize = 2;
    /// Default concurrency of the download stage.
    pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 8;
    /// Default bound of followed redirects per request.
    pub const DEFAULT_MAX_REDIRECT_HOPS: usize = 16;

    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            cache_dir: None,
            response_limits: CacheLimits::default(),
            redirect_limits: CacheLimits::default(),
            trusted_hosts: TrustedHosts::default(),
            cache_read_concurrency: Self::DEFAULT_CACHE_READ_CONCURRENCY,
            download_concurrency: Self::DEFAULT_DOWNLOAD_CONCURRENCY,
            max_redirect_hops: Self::DEFAULT_MAX_REDIRECT_HOPS,
            spawner: None,
            transport: None,
            decoder: BytesDecoder,
        }
    }
}

impl<D> FetchCoordinatorBuilder<D> {
    /// Set the cache directory. The response and redirect caches live in subdirectories of it.
    ///
    /// Required.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Set the size and count bounds of the response cache.
    ///
    /// Default: 1 MiB, 1024 files.
    pub fn with_response_limits(mut self, limits: CacheLimits) -> Self {
        self.response_limits = limits;
        self
    }

    /// Set the size and count bounds of the redirect cache.
    ///
    /// Default: 1 MiB, 1024 files.
    pub fn with_redirect_limits(mut self, limits: CacheLimits) -> Self {
        self.redirect_limits = limits;
        self
    }

    /// Set the hosts whose payloads may be cached.
    ///
    /// Default: no host is trusted, nothing is cached.
    pub fn with_trusted_hosts(mut self, trusted_hosts: TrustedHosts) -> Self {
        self.trusted_hosts = trusted_hosts;
        self
    }

    /// Set how many cache reads may run at the same time.
    ///
    /// Default: 2.
    pub fn with_cache_read_concurrency(mut self, concurrency: usize) -> Self {
        self.cache_read_concurrency = concurrency;
        self
    }

    /// Set how many downloads may run at the same time.
    ///
    /// Default: 8.
    pub fn with_download_concurrency(mut self, concurrency: usize) -> Self {
        self.download_concurrency = concurrency;
        self
    }

    /// Set how many redirects a request may follow, memoized and network ones together.
    ///
    /// Default: 16.
    pub fn with_max_redirect_hops(mut self, hops: usize) -> Self {
        self.max_redirect_hops = hops;
        self
    }

    /// Set the pool that runs all background work.
    ///
    /// Default: the runtime `build` is called on.
    pub fn with_spawner(mut self, spawner: Spawner) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Set the HTTP transport.
    ///
    /// Default: [`ReqwestTransport`].
    pub fn with_transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Set the payload decoder.
    pub fn with_decoder<D2>(self, decoder: D2) -> FetchCoordinatorBuilder<D2> {
        FetchCoordinatorBuilder {
            cache_dir: self.cache_dir,
            response_limits: self.response_limits,
            redirect_limits: self.redirect_limits,
            trusted_hosts: self.trusted_hosts,
            cache_read_concurrency: self.cache_read_concurrency,
            download_concurrency: self.download_concurrency,
            max_redirect_hops: self.max_redirect_hops,
            spawner: self.spawner,
            transport: self.transport,
            decoder,
        }
    }

    /// Open the caches and build the coordinator.
    pub async fn build(self) -> Result<FetchCoordinator<D>>
    where
        D: Decoder,
    {
        let Some(cache_dir) = self.cache_dir else {
            return Err(Error::new(ErrorKind::Config, "cache dir is required"));
        };
        let spawner = self.spawner.unwrap_or_else(Spawner::current);
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };

        let response_cache = ResponseCache::open(
            &cache_dir,
            self.response_limits,
            self.trusted_hosts,
            spawner.clone(),
        )
        .await?;
        let redirect_cache = RedirectCache::open(&cache_dir, self.redirect_limits, spawner.clone()).await?;

        let cache_read = WorkScheduler::new("cache-read", self.cache_read_concurrency, spawner.clone());
        let download = WorkScheduler::new("download", self.download_concurrency, spawner.clone());

        tracing::info!(
            ?cache_dir,
            cache_read = self.cache_read_concurrency,
            download = self.download_concurrency,
            max_redirect_hops = self.max_redirect_hops,
            "[fetch coordinator]: build"
        );

        Ok(FetchCoordinator::new(
            response_cache,
            redirect_cache,
            transport,
            self.decoder,
            cache_read,
            download,
            self.max_redirect_hops,
            spawner,
        ))
    }
}
