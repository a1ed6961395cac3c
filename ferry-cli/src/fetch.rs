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

use std::path::PathBuf;

use anyhow::Context;
use bytes::Bytes;
use bytesize::ByteSize;
use clap::Args;
use ferry::prelude::*;
use tokio::sync::mpsc;
use url::Url;

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// URLs to fetch.
    #[arg(required = true)]
    urls: Vec<Url>,

    /// Cache directory.
    #[arg(short, long, default_value = ".ferry")]
    cache_dir: PathBuf,

    /// Size bound of the response cache.
    #[arg(long, default_value = "1MiB")]
    max_bytes: ByteSize,

    /// File count bound of the response cache.
    #[arg(long, default_value_t = CacheLimits::DEFAULT_MAX_FILES)]
    max_files: usize,

    /// Host suffix whose responses may be cached.
    #[arg(long, default_value = "")]
    trusted_suffix: String,

    /// Cache responses of every host.
    #[arg(long)]
    trust_any_host: bool,

    /// Do not answer from memoized redirects.
    #[arg(long)]
    no_cached_redirects: bool,

    /// Concurrent downloads.
    #[arg(long, default_value_t = 8)]
    downloads: usize,
}

pub async fn run(args: FetchArgs) -> anyhow::Result<()> {
    let trusted_hosts = if args.trust_any_host {
        TrustedHosts::any()
    } else {
        TrustedHosts::new(args.trusted_suffix.clone(), "", "")
    };
    let limits = CacheLimits::default()
        .with_max_bytes(args.max_bytes.as_u64())
        .with_max_files(args.max_files);

    let coordinator = FetchCoordinator::builder()
        .with_cache_dir(&args.cache_dir)
        .with_response_limits(limits)
        .with_trusted_hosts(trusted_hosts)
        .with_download_concurrency(args.downloads)
        .build()
        .await
        .with_context(|| format!("cannot open caches under {}", args.cache_dir.display()))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for (index, url) in args.urls.iter().enumerate() {
        let tx = tx.clone();
        let request = FetchRequest::new(url.clone(), format!("cli-{index}"), move |response: FetchResponse<Bytes>| {
            let _ = tx.send(response);
        })
        .with_cached_redirects(!args.no_cached_redirects);
        coordinator.submit(request)?;
    }
    drop(tx);
    tracing::debug!(count = args.urls.len(), "submitted fetch requests");

    let mut failed = 0;
    while let Some(response) = rx.recv().await {
        match response.result {
            Ok(bytes) => {
                let via = if response.is_cached_redirect { " (cached redirect)" } else { "" };
                println!("{}: {}{via}", response.key.uri, ByteSize::b(bytes.len() as u64));
            }
            Err(e) => {
                failed += 1;
                tracing::debug!(key = %response.key, ?e, "fetch failed");
                println!("{}: {e}", response.key.uri);
            }
        }
    }

    coordinator.shutdown().await?;

    if failed > 0 {
        anyhow::bail!("{failed} of {} fetches failed", args.urls.len());
    }
    Ok(())
}
