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

pub use ferry_common::{
    error::{Error, ErrorKind, Result},
    scheduler::{WorkHandle, WorkScheduler},
    spawn::{SpawnHandle, Spawner},
};
pub use ferry_storage::{CacheLimits, LruFileStore, LruFileStoreConfig, RedirectCache, ResponseCache, TrustedHosts};

pub use crate::{
    builder::FetchCoordinatorBuilder,
    coordinator::FetchCoordinator,
    decoder::{BytesDecoder, Decoder},
    request::{Callback, FetchRequest, FetchResponse, RequestKey},
    transport::{BodyStream, ReqwestTransport, Transport, TransportResponse},
};
