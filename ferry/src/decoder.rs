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
use ferry_common::error::Result;

/// Turns a fetched payload into the value delivered to callers.
///
/// The same payload may come from the network or from the response cache, the decoder cannot tell the difference.
/// A rejected payload is delivered as an [`ErrorKind::Decode`](ferry_common::error::ErrorKind::Decode) error.
pub trait Decoder: Send + Sync + 'static {
    /// Decoded value.
    type Output: Send + 'static;

    /// Decode a complete payload.
    fn decode(&self, bytes: Bytes) -> Result<Self::Output>;
}

/// Delivers payloads as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Output = Bytes;

    fn decode(&self, bytes: Bytes) -> Result<Self::Output> {
        Ok(bytes)
    }
}

/// Decode with a closure.
impl<F, T> Decoder for F
where
    F: Fn(Bytes) -> Result<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn decode(&self, bytes: Bytes) -> Result<Self::Output> {
        self(bytes)
    }
}
