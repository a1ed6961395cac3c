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
    fmt::Debug,
    path::PathBuf,
    pin::Pin,
    task::{Context, Poll},
};

use ferry_common::error::{Error, ErrorKind, Result};
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
};

use super::{buffer, LruFileStore};

/// Write stream of a record in progress.
///
/// The header has already been written when the writer is handed out. Payload bytes go to a private buffer file;
/// [`CacheWriter::close`] publishes the buffer as the record of its key. A writer dropped without `close` discards its
/// buffer, so a partial payload is never published.
pub struct CacheWriter {
    store: LruFileStore,
    key: String,
    buffer: PathBuf,
    /// Clear epoch observed when the buffer was created.
    epoch: u64,
    file: Option<BufWriter<File>>,
    finished: bool,
}

impl Debug for CacheWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWriter")
            .field("key", &self.key)
            .field("buffer", &self.buffer)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl CacheWriter {
    pub(crate) fn new(store: LruFileStore, key: String, buffer: PathBuf, epoch: u64, file: File) -> Self {
        Self {
            store,
            key,
            buffer,
            epoch,
            file: Some(BufWriter::new(file)),
            finished: false,
        }
    }

    /// The cache key the writer publishes to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Flush the buffer file and publish it.
    ///
    /// If the store has been cleared since the buffer was created, the buffer is discarded instead. If another writer
    /// of the same key wins the rename, this writer's buffer is discarded. Either way the record on disk is always a
    /// complete one.
    ///
    /// Returns `true` if this writer's content was published.
    pub async fn close(mut self) -> Result<bool> {
        let Some(mut file) = self.file.take() else {
            return Ok(false);
        };
        file.flush().await?;
        let mut file = file.into_inner();
        file.flush().await?;
        drop(file);

        self.finished = true;
        self.store.publish(self.buffer.clone(), &self.key, self.epoch).await
    }

    /// Discard the buffer without publishing anything.
    pub fn abandon(self) {
        drop(self)
    }

    fn file(self: Pin<&mut Self>) -> std::io::Result<Pin<&mut BufWriter<File>>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Ok(Pin::new(file)),
            None => Err(std::io::Error::other(Error::new(ErrorKind::Closed, "cache writer closed"))),
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(key = %self.key, buffer = ?self.buffer, "[cache writer]: discard unfinished buffer");
            drop(self.file.take());
            buffer::discard(&self.buffer);
        }
    }
}

impl AsyncWrite for CacheWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.file() {
            Ok(file) => file.poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.file() {
            Ok(file) => file.poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.file() {
            Ok(file) => file.poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
