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

//! ferry - a deduplicating resource fetcher with a crash-safe disk cache.
//!
//! A [`FetchCoordinator`] answers fetch requests from an on-disk response cache first and from the network on miss.
//! Concurrent requests for the same resource by the same caller are folded into one, redirects are memoized so that
//! later requests skip the hops, and results are delivered to callbacks on one delivery task.
//!
//! ```no_run
//! use ferry::prelude::*;
//!
//! # async fn run() -> ferry::prelude::Result<()> {
//! let coordinator = FetchCoordinator::builder()
//!     .with_cache_dir("/tmp/ferry")
//!     .with_trusted_hosts(TrustedHosts::new(".cdn.example", "", ""))
//!     .build()
//!     .await?;
//!
//! let url = url::Url::parse("https://img.cdn.example/logo.png").unwrap();
//! coordinator.submit(FetchRequest::new(url, "header", |response: FetchResponse<bytes::Bytes>| {
//!     println!("{}: {:?}", response.key, response.result.map(|bytes| bytes.len()));
//! }))?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod coordinator;
mod decoder;
mod request;
mod transport;

/// Everything needed to build a coordinator and submit requests.
pub mod prelude;

pub use builder::FetchCoordinatorBuilder;
pub use coordinator::FetchCoordinator;
pub use decoder::{BytesDecoder, Decoder};
pub use request::{Callback, FetchRequest, FetchResponse, RequestKey};
pub use transport::{BodyStream, ReqwestTransport, Transport, TransportResponse};
