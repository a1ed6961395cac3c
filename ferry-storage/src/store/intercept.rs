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
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use ferry_common::error::Result;
use futures_core::Stream;
use pin_project::pin_project;
use tokio::io::AsyncWrite;

use super::CacheWriter;

/// A pass-through stream that tees every chunk of its source into a [`CacheWriter`].
///
/// The consumer sees exactly the bytes of the source. A failure of the cache writer is logged and the stream keeps
/// passing bytes through without caching. The record is published by [`InterceptStream::close`], and only if the
/// source was read to its end without error.
#[pin_project]
pub struct InterceptStream<S> {
    #[pin]
    source: S,
    writer: Option<CacheWriter>,
    /// Chunk read from the source but not yet fully written to the writer.
    pending: Option<Bytes>,
    written: usize,
    finished: bool,
}

impl<S> InterceptStream<S> {
    pub(crate) fn new(source: S, writer: Option<CacheWriter>) -> Self {
        Self {
            source,
            writer,
            pending: None,
            written: 0,
            finished: false,
        }
    }

    /// A stream that passes `source` through without caching anything.
    pub fn passthrough(source: S) -> Self {
        Self::new(source, None)
    }

    /// Returns `true` if the stream is still writing to a record.
    pub fn is_caching(&self) -> bool {
        self.writer.is_some()
    }

    /// Returns `true` if the source has been read to its end.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Close the stream.
    ///
    /// Publishes the record if the source was fully consumed, discards it otherwise. Returns `true` if a record was
    /// published.
    pub async fn close(self) -> Result<bool> {
        let Self { writer, finished, .. } = self;
        match writer {
            Some(writer) if finished => writer.close().await,
            Some(writer) => {
                tracing::debug!(key = writer.key(), "[intercept stream]: closed before the end of source, discard");
                writer.abandon();
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

impl<S> Stream for InterceptStream<S>
where
    S: Stream<Item = Result<Bytes>>,
{
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(chunk) = this.pending.take() {
                if let Some(writer) = this.writer.as_mut() {
                    match poll_write_all(writer, cx, &chunk, this.written) {
                        Poll::Pending => {
                            *this.pending = Some(chunk);
                            return Poll::Pending;
                        }
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => {
                            tracing::warn!(key = writer.key(), ?e, "[intercept stream]: cache write failed, stop caching");
                            *this.writer = None;
                        }
                    }
                }
                *this.written = 0;
                return Poll::Ready(Some(Ok(chunk)));
            }

            if *this.finished {
                return Poll::Ready(None);
            }

            match ready!(this.source.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => {
                    if !chunk.is_empty() {
                        *this.pending = Some(chunk);
                    }
                }
                Some(Err(e)) => {
                    if let Some(writer) = this.writer.take() {
                        tracing::debug!(key = writer.key(), ?e, "[intercept stream]: source failed, discard");
                    }
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    *this.finished = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

fn poll_write_all(
    writer: &mut CacheWriter,
    cx: &mut Context<'_>,
    chunk: &[u8],
    written: &mut usize,
) -> Poll<std::io::Result<()>> {
    while *written < chunk.len() {
        match ready!(Pin::new(&mut *writer).poll_write(cx, &chunk[*written..])) {
            Ok(0) => return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into())),
            Ok(n) => *written += n,
            Err(e) => return Poll::Ready(Err(e)),
        }
    }
    Poll::Ready(Ok(()))
}

#[cfg(test)]
mod tests {
    use futures_util::{stream, StreamExt, TryStreamExt};
    use tempfile::tempdir;

    use super::*;
    use crate::store::{CacheLimits, LruFileStore, LruFileStoreConfig};
    use ferry_common::{
        error::{Error, ErrorKind},
        spawn::Spawner,
    };

    async fn store(dir: &std::path::Path) -> LruFileStore {
        LruFileStore::open(
            LruFileStoreConfig::new(dir, "store").with_limits(CacheLimits::default()),
            Spawner::current(),
        )
        .await
        .unwrap()
    }

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes>> {
        stream::iter(parts.iter().map(|p| Ok(Bytes::from_static(p))).collect::<Vec<_>>())
    }

    #[test_log::test(tokio::test)]
    async fn test_tee_and_publish() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).await;

        let mut intercept = store
            .intercept_and_store("k", chunks(&[b"he", b"", b"llo"]))
            .await
            .unwrap();
        let mut seen = vec![];
        while let Some(chunk) = intercept.try_next().await.unwrap() {
            seen.extend_from_slice(&chunk);
        }
        assert_eq!(seen, b"hello");
        assert!(intercept.is_finished());
        assert!(intercept.close().await.unwrap());

        let reader = store.get("k", None).await.unwrap().unwrap();
        assert_eq!(reader.read_to_bytes().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[test_log::test(tokio::test)]
    async fn test_early_close_discards() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).await;

        let mut intercept = store
            .intercept_and_store("k", chunks(&[b"he", b"llo"]))
            .await
            .unwrap();
        assert_eq!(intercept.next().await.unwrap().unwrap(), Bytes::from_static(b"he"));
        assert!(!intercept.close().await.unwrap());

        assert!(store.get("k", None).await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_source_error_discards() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()).await;

        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"he")),
            Err(Error::new(ErrorKind::Network, "connection reset")),
        ]);
        let mut intercept = store.intercept_and_store("k", source).await.unwrap();
        assert!(intercept.next().await.unwrap().is_ok());
        assert_eq!(intercept.next().await.unwrap().unwrap_err().kind(), ErrorKind::Network);
        assert!(!intercept.is_caching());
        assert!(!intercept.close().await.unwrap());

        assert!(store.get("k", None).await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_passthrough() {
        let mut intercept = InterceptStream::passthrough(chunks(&[b"a", b"b"]));
        assert!(!intercept.is_caching());
        let all: Vec<Bytes> = (&mut intercept).try_collect().await.unwrap();
        assert_eq!(all, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert!(!intercept.close().await.unwrap());
    }
}
