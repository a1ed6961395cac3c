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

//! Disk cache for ferry.
//!
//! [`LruFileStore`] is a crash-safe, quota-bounded record store in one directory. [`ResponseCache`] and
//! [`RedirectCache`] are the two ways the fetch coordinator uses it.

mod redirect;
mod response;
/// The on-disk LRU record store.
pub mod store;

pub use redirect::RedirectCache;
pub use response::{ResponseCache, TrustedHosts};
pub use store::{
    storage_name, CacheLimits, CacheReader, CacheWriter, InterceptStream, LruFileStore, LruFileStoreConfig, StoreUsage,
};
