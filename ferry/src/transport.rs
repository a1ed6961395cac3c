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

use std::{fmt::Debug, time::Duration};

use bytes::Bytes;
use ferry_common::error::{Error, ErrorKind, Result};
use futures_util::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt, TryStreamExt};
use reqwest::{header::LOCATION, redirect::Policy, Client};
use url::Url;

/// Response body as a stream of chunks.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// Status line, redirect target and body of an HTTP response.
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw `Location` header, if any.
    pub location: Option<String>,
    /// Response body.
    pub body: BodyStream,
}

impl Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("location", &self.location)
            .finish()
    }
}

/// Performs HTTP GET requests for the coordinator.
///
/// Implementations must not follow redirects themselves: 3xx responses are returned as they are, so that the
/// coordinator can observe and memoize them.
pub trait Transport: Send + Sync + 'static {
    /// Send a GET request of `url`.
    ///
    /// Returns an error only if no response could be received. Any status, error statuses included, is a response.
    fn get<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<TransportResponse>>;
}

/// [`Transport`] backed by a [`reqwest::Client`] with redirects disabled.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Connect timeout of the default client.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
    /// Request timeout of the default client.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a transport with a default client.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(Self::DEFAULT_CONNECT_TIMEOUT)
            .timeout(Self::DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::new(ErrorKind::Config, "cannot build http client").with_source(e))?;
        Ok(Self { client })
    }

    /// Create a transport with a caller-built client.
    ///
    /// The client must be built with [`Policy::none`], or redirects are never observed.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn get<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<TransportResponse>> {
        async move {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| Error::network(e).with_context("url", url))?;

            let status = response.status().as_u16();
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.bytes_stream().map_err(Error::network).boxed();

            Ok(TransportResponse { status, location, body })
        }
        .boxed()
    }
}
