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
use clap::Args;
use ferry::prelude::*;

#[derive(Debug, Args)]
pub struct ClearArgs {
    /// Cache directory.
    #[arg(short, long)]
    cache_dir: PathBuf,
}

pub async fn run(args: ClearArgs) -> anyhow::Result<()> {
    let coordinator = FetchCoordinator::builder()
        .with_cache_dir(&args.cache_dir)
        .build()
        .await
        .with_context(|| format!("cannot open caches under {}", args.cache_dir.display()))?;

    coordinator.clear_all().await?.await?;
    tracing::info!(dir = %args.cache_dir.display(), "caches cleared");
    coordinator.shutdown().await?;

    println!("cleared {}", args.cache_dir.display());
    Ok(())
}
