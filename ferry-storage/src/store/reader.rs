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
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use ferry_common::error::Result;
use pin_project::pin_project;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf},
};

/// Payload stream of a cache hit, positioned right after the record header.
///
/// Records are never modified after they are published, so the stream stays valid even if the record is evicted
/// while it is being read.
#[pin_project]
pub struct CacheReader {
    key: String,
    #[pin]
    inner: BufReader<File>,
}

impl Debug for CacheReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheReader").field("key", &self.key).finish()
    }
}

impl CacheReader {
    pub(crate) fn new(key: String, file: File) -> Self {
        Self {
            key,
            inner: BufReader::new(file),
        }
    }

    /// The cache key of the record being read.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the rest of the payload into memory.
    pub async fn read_to_bytes(mut self) -> Result<Bytes> {
        let mut buf = vec![];
        self.read_to_end(&mut buf).await?;
        Ok(buf.into())
    }
}

impl AsyncRead for CacheReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}
