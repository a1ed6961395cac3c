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

use std::fmt::{Debug, Display};

use ferry_common::error::Result;
use url::Url;

/// Identity of a fetch request: the resource URL and the tag of the caller that asked for it.
///
/// At most one request per key is in flight at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    /// The resource URL as submitted, before any redirect.
    pub uri: Url,
    /// Opaque tag of the caller, e.g. the id of the view that shows the resource.
    pub caller_tag: String,
}

impl RequestKey {
    /// Create a request key.
    pub fn new(uri: Url, caller_tag: impl Into<String>) -> Self {
        Self {
            uri,
            caller_tag: caller_tag.into(),
        }
    }
}

impl Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.uri, self.caller_tag)
    }
}

/// Result of a fetch, handed to the request's callback.
#[derive(Debug)]
pub struct FetchResponse<T> {
    /// Key of the request the response belongs to.
    pub key: RequestKey,
    /// The decoded payload, or why there is none.
    pub result: Result<T>,
    /// Set if the payload was found in the cache by following memoized redirects.
    pub is_cached_redirect: bool,
}

/// Completion callback of a fetch request. Runs on the coordinator's delivery task.
pub type Callback<T> = Box<dyn FnOnce(FetchResponse<T>) + Send + 'static>;

/// A request to fetch the resource at a URL.
pub struct FetchRequest<T> {
    pub(crate) key: RequestKey,
    pub(crate) allow_cached_redirects: bool,
    pub(crate) callback: Callback<T>,
}

impl<T> Debug for FetchRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("key", &self.key)
            .field("allow_cached_redirects", &self.allow_cached_redirects)
            .finish()
    }
}

impl<T> FetchRequest<T> {
    /// Create a request of `uri` on behalf of the caller tagged `caller_tag`.
    ///
    /// Memoized redirects are not followed unless enabled with [`FetchRequest::with_cached_redirects`].
    pub fn new<F>(uri: Url, caller_tag: impl Into<String>, callback: F) -> Self
    where
        F: FnOnce(FetchResponse<T>) + Send + 'static,
    {
        Self {
            key: RequestKey::new(uri, caller_tag),
            allow_cached_redirects: false,
            callback: Box::new(callback),
        }
    }

    /// Allow or forbid answering the request through memoized redirects.
    pub fn with_cached_redirects(mut self, allow: bool) -> Self {
        self.allow_cached_redirects = allow;
        self
    }

    /// The request key.
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Returns `true` if memoized redirects may be followed.
    pub fn allows_cached_redirects(&self) -> bool {
        self.allow_cached_redirects
    }
}
