// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use thiserror::Error;

/// The closed set of error kinds a scheduler replica can observe, per the
/// coordination protocol's error handling design.
#[derive(Debug, Error)]
pub enum Error {
    /// The KV store was unreachable or returned a transport-level failure.
    /// Recoverable: the reactor restarts its watch from the last index.
    #[error("transport error talking to KV store: {0}")]
    Transport(String),

    /// A non-blocking lock attempt found another holder already in place.
    #[error("lock unavailable for resource {0}")]
    LockUnavailable(String),

    /// A compare-and-swap lost the race to a concurrent writer.
    #[error("conflicting write on key {0}")]
    Conflict(String),

    /// The requested key does not exist. Treated as empty by callers, not
    /// surfaced to them as an error in most code paths.
    #[error("key not found: {0}")]
    NotFound(String),

    /// A stored record failed to deserialize. The bad key is logged and
    /// skipped; it never crashes a replica.
    #[error("malformed record at {key}: {source}")]
    MalformedRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Misconfiguration discovered at boot, before the reactor starts.
    #[error("fatal configuration error: {0}")]
    Fatal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
