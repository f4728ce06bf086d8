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

//! An in-process `KeyValueStore` used by the test suite in place of a real
//! etcd cluster. Plays the role the teacher's `SledClient::try_new_temporary`
//! plays for scheduler tests: a fast, disposable backend with the same
//! contract as the production implementation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::{ChangeEvent, ChangeKind, ChangeStream, KeyValueStore, Node};
use crate::error::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

struct Entry {
    value: Vec<u8>,
    modification_index: u64,
    expires_at: Option<Instant>,
}

struct Inner {
    entries: HashMap<String, Entry>,
    next_index: u64,
    log: Vec<ChangeEvent>,
    events: broadcast::Sender<ChangeEvent>,
}

impl Inner {
    fn record(&mut self, event: ChangeEvent) {
        self.log.push(event.clone());
        // A send error just means nobody is currently watching.
        let _ = self.events.send(event);
    }

    fn next_index(&mut self) -> u64 {
        self.next_index += 1;
        self.next_index
    }

    fn expire_if_due(&mut self, key: &str) {
        let expired = matches!(
            self.entries.get(key),
            Some(entry) if entry.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
        );
        if expired {
            if let Some(entry) = self.entries.remove(key) {
                let index = self.next_index();
                self.record(ChangeEvent {
                    kind: ChangeKind::Expire,
                    key: key.to_owned(),
                    old_value: Some(entry.value),
                    new_value: None,
                    modification_index: index,
                });
            }
        }
    }
}

/// An in-memory, single-process stand-in for the external KV store.
#[derive(Clone)]
pub struct MemoryKv {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: std::sync::Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                next_index: 0,
                log: Vec::new(),
                events,
            })),
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Node> {
        let mut guard = self.inner.lock();
        guard.expire_if_due(key);
        guard
            .entries
            .get(key)
            .map(|entry| Node {
                key: key.to_owned(),
                value: entry.value.clone(),
                modification_index: entry.modification_index,
            })
            .ok_or_else(|| Error::NotFound(key.to_owned()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<Node>> {
        let mut guard = self.inner.lock();
        let keys: Vec<String> = guard
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            guard.expire_if_due(key);
        }
        Ok(guard
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, entry)| Node {
                key: k.clone(),
                value: entry.value.clone(),
                modification_index: entry.modification_index,
            })
            .collect())
    }

    async fn create(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64> {
        let mut guard = self.inner.lock();
        guard.expire_if_due(key);
        if guard.entries.contains_key(key) {
            return Err(Error::Conflict(key.to_owned()));
        }
        let index = guard.next_index();
        guard.entries.insert(
            key.to_owned(),
            Entry {
                value: value.clone(),
                modification_index: index,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        guard.record(ChangeEvent {
            kind: ChangeKind::Create,
            key: key.to_owned(),
            old_value: None,
            new_value: Some(value),
            modification_index: index,
        });
        Ok(index)
    }

    async fn update(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64> {
        let mut guard = self.inner.lock();
        guard.expire_if_due(key);
        let old_value = match guard.entries.get(key) {
            Some(entry) => entry.value.clone(),
            None => return Err(Error::NotFound(key.to_owned())),
        };
        let index = guard.next_index();
        guard.entries.insert(
            key.to_owned(),
            Entry {
                value: value.clone(),
                modification_index: index,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        guard.record(ChangeEvent {
            kind: ChangeKind::Update,
            key: key.to_owned(),
            old_value: Some(old_value),
            new_value: Some(value),
            modification_index: index,
        });
        Ok(index)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64> {
        let mut guard = self.inner.lock();
        guard.expire_if_due(key);
        let old_value = guard.entries.get(key).map(|entry| entry.value.clone());
        let kind = if old_value.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Create
        };
        let index = guard.next_index();
        guard.entries.insert(
            key.to_owned(),
            Entry {
                value: value.clone(),
                modification_index: index,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        guard.record(ChangeEvent {
            kind,
            key: key.to_owned(),
            old_value,
            new_value: Some(value),
            modification_index: index,
        });
        Ok(index)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<u64> {
        let mut guard = self.inner.lock();
        guard.expire_if_due(key);
        let current = guard.entries.get(key).map(|entry| entry.value.clone());
        if current.as_deref() != Some(expected) {
            return Err(Error::Conflict(key.to_owned()));
        }
        let index = guard.next_index();
        guard.entries.insert(
            key.to_owned(),
            Entry {
                value: value.clone(),
                modification_index: index,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        guard.record(ChangeEvent {
            kind: ChangeKind::Update,
            key: key.to_owned(),
            old_value: current,
            new_value: Some(value),
            modification_index: index,
        });
        Ok(index)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock();
        guard.expire_if_due(key);
        let current = guard.entries.get(key).map(|entry| entry.value.clone());
        if current.as_deref() != Some(expected) {
            return Err(Error::Conflict(key.to_owned()));
        }
        guard.entries.remove(key);
        let index = guard.next_index();
        guard.record(ChangeEvent {
            kind: ChangeKind::Delete,
            key: key.to_owned(),
            old_value: current,
            new_value: None,
            modification_index: index,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.entries.remove(key) {
            let index = guard.next_index();
            guard.record(ChangeEvent {
                kind: ChangeKind::Delete,
                key: key.to_owned(),
                old_value: Some(entry.value),
                new_value: None,
                modification_index: index,
            });
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut guard = self.inner.lock();
        let keys: Vec<String> = guard
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = guard.entries.remove(&key) {
                let index = guard.next_index();
                guard.record(ChangeEvent {
                    kind: ChangeKind::Delete,
                    key,
                    old_value: Some(entry.value),
                    new_value: None,
                    modification_index: index,
                });
            }
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str, from_index: u64) -> Result<ChangeStream> {
        let prefix = prefix.to_owned();
        let (backlog, receiver) = {
            let guard = self.inner.lock();
            let backlog: Vec<ChangeEvent> = guard
                .log
                .iter()
                .filter(|e| e.modification_index > from_index && e.key.starts_with(&prefix))
                .cloned()
                .collect();
            (backlog, guard.events.subscribe())
        };

        let prefix_for_live = prefix.clone();
        let live = BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(event) if event.key.starts_with(&prefix_for_live) => Some(Ok(event)),
            Ok(_) => None,
            Err(_lagged) => Some(Err(Error::Transport(
                "watch fell behind and lost events".to_owned(),
            ))),
        });

        let backlog_stream = tokio_stream::iter(backlog.into_iter().map(Ok));
        Ok(Box::pin(backlog_stream.chain(live)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let kv = MemoryKv::new();
        kv.create("/a", b"1".to_vec(), None).await.unwrap();
        let node = kv.get("/a").await.unwrap();
        assert_eq!(node.value, b"1");
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let kv = MemoryKv::new();
        kv.create("/a", b"1".to_vec(), None).await.unwrap();
        let err = kv.create("/a", b"2".to_vec(), None).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_expected() {
        let kv = MemoryKv::new();
        kv.create("/a", b"1".to_vec(), None).await.unwrap();
        let err = kv
            .compare_and_swap("/a", b"wrong", b"2".to_vec(), None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let kv = MemoryKv::new();
        kv.create("/a", b"1".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = kv.get("/a").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn watch_replays_backlog_then_streams_live() {
        let kv = MemoryKv::new();
        kv.create("/root/a", b"1".to_vec(), None).await.unwrap();
        let mut stream = kv.watch("/root/", 0).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.key, "/root/a");

        kv.create("/root/b", b"2".to_vec(), None).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.key, "/root/b");
    }
}
