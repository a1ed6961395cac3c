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

//! Shared components for ferry.

/// Convert blocking calls to async calls on the shared pool.
pub mod asyncify;
/// The error type shared by all ferry crates.
pub mod error;
/// Bounded-concurrency work scheduler with cancel and promote.
pub mod scheduler;
/// The shared pool that runs background work.
pub mod spawn;
