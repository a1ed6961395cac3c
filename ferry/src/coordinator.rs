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

use std::{
    collections::HashMap,
    fmt::Debug,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use ferry_common::{
    error::{Error, ErrorKind, Result},
    scheduler::{Work, WorkHandle, WorkScheduler},
    spawn::{SpawnHandle, Spawner},
};
use ferry_storage::{RedirectCache, ResponseCache};
use futures_util::TryStreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use crate::{
    builder::FetchCoordinatorBuilder,
    decoder::{BytesDecoder, Decoder},
    request::{Callback, FetchRequest, FetchResponse, RequestKey},
    transport::{BodyStream, Transport},
};

struct PendingRequest<T> {
    /// The latest request submitted under the key. Only its callback ever fires.
    request: FetchRequest<T>,
    cancelled: bool,
    /// The stage currently scheduled or running for the request.
    handle: WorkHandle,
}

type Delivery<T> = (Callback<T>, FetchResponse<T>);

pub(crate) struct CoordinatorInner<D: Decoder> {
    pub(crate) response_cache: ResponseCache,
    pub(crate) redirect_cache: RedirectCache,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) decoder: D,
    pub(crate) cache_read: WorkScheduler,
    pub(crate) download: WorkScheduler,
    pub(crate) max_redirect_hops: usize,
    pub(crate) spawner: Spawner,

    pending: Mutex<HashMap<RequestKey, PendingRequest<D::Output>>>,
    delivery: Mutex<Option<mpsc::UnboundedSender<Delivery<D::Output>>>>,
    delivery_task: Mutex<Option<SpawnHandle<()>>>,
}

/// Fetches resources through a two-stage pipeline: a cache read, then a network download on miss.
///
/// Concurrent requests with the same [`RequestKey`] are folded into one. Redirects are observed, memoized and
/// followed explicitly. Results are handed to the request callbacks on a single delivery task, at most once per
/// request and never for a request cancelled while its work was still pending.
///
/// Cloning is cheap, all clones share the same coordinator.
pub struct FetchCoordinator<D: Decoder = BytesDecoder> {
    inner: Arc<CoordinatorInner<D>>,
}

impl<D: Decoder> Clone for FetchCoordinator<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Decoder> Debug for FetchCoordinator<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("cache_read", &self.inner.cache_read)
            .field("download", &self.inner.download)
            .field("pending", &self.pending_count())
            .field("max_redirect_hops", &self.inner.max_redirect_hops)
            .finish()
    }
}

impl FetchCoordinator<BytesDecoder> {
    /// Start building a coordinator that delivers raw payloads.
    pub fn builder() -> FetchCoordinatorBuilder<BytesDecoder> {
        FetchCoordinatorBuilder::new()
    }
}

impl<D: Decoder> FetchCoordinator<D> {
    #[expect(clippy::too_many_arguments)]
    pub(crate) fn new(
        response_cache: ResponseCache,
        redirect_cache: RedirectCache,
        transport: Arc<dyn Transport>,
        decoder: D,
        cache_read: WorkScheduler,
        download: WorkScheduler,
        max_redirect_hops: usize,
        spawner: Spawner,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let delivery_task = spawner.spawn(deliver_loop(rx));

        let inner = CoordinatorInner {
            response_cache,
            redirect_cache,
            transport,
            decoder,
            cache_read,
            download,
            max_redirect_hops,
            spawner,
            pending: Mutex::new(HashMap::new()),
            delivery: Mutex::new(Some(tx)),
            delivery_task: Mutex::new(Some(delivery_task)),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit a fetch request.
    ///
    /// If a request with the same key is in flight, the new request replaces it: the old callback never fires, a
    /// pending cancellation is revoked and the in-flight work is promoted to the head of its queue. No new work is
    /// created.
    pub fn submit(&self, request: FetchRequest<D::Output>) -> Result<()> {
        if self.inner.delivery.lock().is_none() {
            return Err(Error::closed());
        }

        let key = request.key.clone();
        let mut pending = self.inner.pending.lock();

        if let Some(entry) = pending.get_mut(&key) {
            tracing::trace!(%key, "[fetch coordinator]: fold duplicate request");
            entry.request = request;
            entry.cancelled = false;
            entry.handle.promote();
            return Ok(());
        }

        // Registered before the lock is released, so cancel and prioritize always see a complete entry.
        let work = read_from_cache(self.inner.clone(), key.clone(), key.uri.clone(), 0);
        let handle = self.inner.cache_read.enqueue(work, false);
        pending.insert(
            key,
            PendingRequest {
                request,
                cancelled: false,
                handle,
            },
        );
        Ok(())
    }

    /// Cancel the request of `key`.
    ///
    /// Returns `true` if the request's work had not started yet: it is dropped and the request will never be
    /// answered. Returns `false` if there is no such request, or if its work is already running: the work runs to
    /// completion but its result is discarded.
    pub fn cancel(&self, key: &RequestKey) -> bool {
        let mut pending = self.inner.pending.lock();
        let Some(entry) = pending.get_mut(key) else {
            return false;
        };
        entry.cancelled = true;
        if entry.handle.cancel() {
            pending.remove(key);
            tracing::trace!(%key, "[fetch coordinator]: cancelled pending request");
            true
        } else {
            tracing::trace!(%key, "[fetch coordinator]: request running, suppress its result");
            false
        }
    }

    /// Move the pending work of `key` to the head of its queue. No-op if there is no such request or its work is
    /// running.
    pub fn prioritize(&self, key: &RequestKey) {
        if let Some(entry) = self.inner.pending.lock().get(key) {
            entry.handle.promote();
        }
    }

    /// Clear the response cache and the redirect cache.
    ///
    /// Records are deleted in the background, the returned handle completes when both caches are empty.
    pub async fn clear_all(&self) -> Result<SpawnHandle<()>> {
        let response = self.inner.response_cache.clear().await?;
        let redirect = self.inner.redirect_cache.clear().await?;
        Ok(self.inner.spawner.spawn(async move {
            for (name, handle) in [("response", response), ("redirect", redirect)] {
                if let Err(e) = handle.await {
                    tracing::warn!(name, ?e, "[fetch coordinator]: cache clear task failed");
                }
            }
        }))
    }

    /// Count of requests in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// The response cache.
    pub fn response_cache(&self) -> &ResponseCache {
        &self.inner.response_cache
    }

    /// The redirect cache.
    pub fn redirect_cache(&self) -> &RedirectCache {
        &self.inner.redirect_cache
    }

    /// Scheduler of the cache-read stage.
    pub fn cache_read_scheduler(&self) -> &WorkScheduler {
        &self.inner.cache_read
    }

    /// Scheduler of the download stage.
    pub fn download_scheduler(&self) -> &WorkScheduler {
        &self.inner.download
    }

    /// Stop accepting requests and wait until every queued result has been delivered.
    ///
    /// Work still in flight keeps running, but its results are dropped.
    pub async fn shutdown(&self) -> Result<()> {
        drop(self.inner.delivery.lock().take());
        let task = self.inner.delivery_task.lock().take();
        if let Some(task) = task {
            task.await?;
        }
        tracing::info!("[fetch coordinator]: shutdown");
        Ok(())
    }
}

async fn deliver_loop<T>(mut rx: mpsc::UnboundedReceiver<Delivery<T>>) {
    while let Some((callback, response)) = rx.recv().await {
        let key = response.key.clone();
        if catch_unwind(AssertUnwindSafe(move || callback(response))).is_err() {
            tracing::error!(%key, "[fetch coordinator]: callback panicked");
        }
    }
}

impl<D: Decoder> CoordinatorInner<D> {
    /// Remove the request of `key` and hand `result` to its callback, unless it has been cancelled.
    fn finish(&self, key: &RequestKey, result: Result<D::Output>, is_cached_redirect: bool) {
        let Some(entry) = self.pending.lock().remove(key) else {
            return;
        };
        if entry.cancelled {
            tracing::trace!(%key, "[fetch coordinator]: drop result of cancelled request");
            return;
        }

        let response = FetchResponse {
            key: entry.request.key,
            result,
            is_cached_redirect,
        };
        let delivery = self.delivery.lock();
        let sent = delivery
            .as_ref()
            .map(|tx| tx.send((entry.request.callback, response)).is_ok())
            .unwrap_or(false);
        if !sent {
            tracing::debug!(%key, "[fetch coordinator]: shut down, drop result");
        }
    }

    /// Re-arm the request of `key` with the next stage, built by `next`.
    ///
    /// A request cancelled meanwhile is removed instead.
    fn rearm(&self, key: &RequestKey, scheduler: &WorkScheduler, next: impl FnOnce() -> Work) {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(key) else {
            return;
        };
        if entry.cancelled {
            pending.remove(key);
            tracing::trace!(%key, "[fetch coordinator]: request cancelled between stages");
            return;
        }
        entry.handle = scheduler.enqueue(next(), false);
    }

    fn allows_cached_redirects(&self, key: &RequestKey) -> Option<bool> {
        self.pending
            .lock()
            .get(key)
            .map(|entry| entry.request.allow_cached_redirects)
    }

    fn decode(&self, bytes: Bytes) -> Result<D::Output> {
        self.decoder.decode(bytes).map_err(|e| match e.kind() {
            ErrorKind::Decode => e,
            _ => Error::new(ErrorKind::Decode, "cannot decode payload").with_source(e),
        })
    }
}

/// Cache-read stage: walk memoized redirects if allowed, then look the resource up in the response cache.
fn read_from_cache<D: Decoder>(inner: Arc<CoordinatorInner<D>>, key: RequestKey, uri: Url, hops: usize) -> Work {
    Box::pin(async move {
        let Some(allow_cached_redirects) = inner.allows_cached_redirects(&key) else {
            return;
        };

        let mut uri = uri;
        let mut hops = hops;
        let mut is_cached_redirect = false;
        if allow_cached_redirects {
            while let Some(to) = inner.redirect_cache.get_redirect(&uri).await {
                if hops >= inner.max_redirect_hops {
                    tracing::debug!(%key, %uri, hops, "[fetch coordinator]: cached redirect walk hit the hop limit");
                    break;
                }
                tracing::trace!(%key, from = %uri, %to, "[fetch coordinator]: follow cached redirect");
                uri = to;
                hops += 1;
                is_cached_redirect = true;
            }
        }

        if let Some(reader) = inner.response_cache.get(&uri).await {
            match reader.read_to_bytes().await {
                Ok(bytes) => {
                    tracing::trace!(%key, %uri, "[fetch coordinator]: cache hit");
                    let result = inner.decode(bytes);
                    inner.finish(&key, result, is_cached_redirect);
                    return;
                }
                Err(e) => tracing::warn!(%key, %uri, ?e, "[fetch coordinator]: cannot read cached payload, download"),
            }
        }

        let next = {
            let inner = inner.clone();
            let key = key.clone();
            move || download(inner, key, uri, hops)
        };
        inner.rearm(&key, &inner.download, next);
    })
}

/// Download stage: GET the resource with redirects observed, cache the payload as it streams in.
fn download<D: Decoder>(inner: Arc<CoordinatorInner<D>>, key: RequestKey, uri: Url, hops: usize) -> Work {
    Box::pin(async move {
        let response = match inner.transport.get(&uri).await {
            Ok(response) => response,
            Err(e) => {
                inner.finish(&key, Err(e), false);
                return;
            }
        };

        match response.status {
            200 => {
                let body = inner.response_cache.intercept(&uri, response.body).await;
                let result = collect(body).await.and_then(|bytes| inner.decode(bytes));
                inner.finish(&key, result, false);
            }
            301 | 302 => {
                let to = match redirect_target(&uri, response.location.as_deref()) {
                    Ok(to) => to,
                    Err(e) => {
                        inner.finish(&key, Err(e), false);
                        return;
                    }
                };
                inner.redirect_cache.put_redirect(&uri, &to).await;

                if hops >= inner.max_redirect_hops {
                    inner.finish(&key, Err(Error::too_many_redirects(hops + 1, &key.uri)), false);
                    return;
                }
                tracing::trace!(%key, from = %uri, %to, status = response.status, "[fetch coordinator]: redirect");

                // A second hop may already be memoized, so go back to the cache-read stage.
                let next = {
                    let inner = inner.clone();
                    let key = key.clone();
                    move || read_from_cache(inner, key, to, hops + 1)
                };
                inner.rearm(&key, &inner.cache_read, next);
            }
            status => {
                let text = match collect_text(response.body).await {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::debug!(%key, ?e, "[fetch coordinator]: cannot read error body");
                        String::new()
                    }
                };
                inner.finish(&key, Err(Error::status(status, &uri, text)), false);
            }
        }
    })
}

fn redirect_target(from: &Url, location: Option<&str>) -> Result<Url> {
    let Some(location) = location else {
        return Err(Error::new(ErrorKind::Parse, "redirect without location").with_context("url", from));
    };
    from.join(location).map_err(|e| {
        Error::new(ErrorKind::Parse, "malformed redirect location")
            .with_context("url", from)
            .with_context("location", location)
            .with_source(e)
    })
}

/// Read an intercepted body to its end, then close it so the record gets published.
async fn collect(mut body: ferry_storage::InterceptStream<BodyStream>) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.try_next().await? {
        buf.extend_from_slice(&chunk);
    }
    if let Err(e) = body.close().await {
        tracing::warn!(?e, "[fetch coordinator]: cannot publish cached payload");
    }
    Ok(buf.freeze())
}

async fn collect_text(body: BodyStream) -> Result<String> {
    let chunks: Vec<Bytes> = body.try_collect().await?;
    Ok(String::from_utf8_lossy(&chunks.concat()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_target() {
        let from = Url::parse("https://a.example/img/1.png").unwrap();

        assert_eq!(
            redirect_target(&from, Some("https://b.example/x")).unwrap().as_str(),
            "https://b.example/x"
        );
        assert_eq!(
            redirect_target(&from, Some("/2.png")).unwrap().as_str(),
            "https://a.example/2.png"
        );
        assert_eq!(
            redirect_target(&from, Some("3.png")).unwrap().as_str(),
            "https://a.example/img/3.png"
        );
        assert_eq!(redirect_target(&from, None).unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(
            redirect_target(&from, Some("https://[::1")).unwrap_err().kind(),
            ErrorKind::Parse
        );
    }
}
