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

use crate::{error::Result, spawn::Spawner};

/// Convert the blocking call to async call with the given spawner.
///
/// A join failure of the blocking task is flattened into the returned error.
pub async fn asyncify_with_spawner<F, T>(spawner: &Spawner, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawner.spawn_blocking(f).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};

    #[tokio::test]
    async fn test_asyncify() {
        let spawner = Spawner::current();
        assert_eq!(asyncify_with_spawner(&spawner, || Ok(1 + 1)).await.unwrap(), 2);

        let err = asyncify_with_spawner::<_, ()>(&spawner, || Err(Error::new(ErrorKind::Io, "nope")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
