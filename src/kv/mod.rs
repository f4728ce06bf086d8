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

//! Typed facade over the external KV store. Models the capabilities the
//! coordination protocol actually needs: atomic create, compare-and-swap,
//! TTL with server-side expiry, recursive prefix reads, and a restartable
//! watch stream carrying a monotonic modification index.

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;

/// A single node read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub key: String,
    pub value: Vec<u8>,
    pub modification_index: u64,
}

/// The kind of change that produced a `ChangeEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    /// The key's TTL lapsed; the store expired it server-side.
    Expire,
}

/// A single change observed on a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub key: String,
    pub old_value: Option<Vec<u8>>,
    pub new_value: Option<Vec<u8>>,
    pub modification_index: u64,
}

pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent>> + Send>>;

/// Typed operations over the external KV store. Implementations must give
/// every successful write a modification index usable to restart a watch
/// without losing events within the store's history window.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a single key. Returns `Error::NotFound` if absent.
    async fn get(&self, key: &str) -> Result<Node>;

    /// Read every key under `prefix` (recursive, like etcd's `dir=true`).
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<Node>>;

    /// Create `key` with `value` and optional TTL. Fails with
    /// `Error::Conflict` if the key already exists.
    async fn create(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64>;

    /// Overwrite `key` with `value` and optional TTL. Fails with
    /// `Error::NotFound` if the key does not already exist.
    async fn update(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64>;

    /// Write `key` unconditionally, creating or overwriting.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64>;

    /// Write `value` to `key` only if its current value equals `expected`.
    /// Fails with `Error::Conflict` if the current value differs (including
    /// the key not existing, when `expected` is non-empty).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<u64>;

    /// Delete `key` only if its current value equals `expected`, reporting
    /// `Error::Conflict` on mismatch. Used to unlock a mutex only while we
    /// still hold it.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<()>;

    /// Delete `key` unconditionally. Not an error if it is already absent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key under `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Watch every change under `prefix` starting strictly after
    /// `from_index` (0 means "from the beginning of the store's history").
    async fn watch(&self, prefix: &str, from_index: u64) -> Result<ChangeStream>;
}
