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

//! A TTL-bearing distributed mutual-exclusion lease, the only
//! synchronization primitive shared between scheduler replicas.
//!
//! The original source acquired a lock by doing a `Get` followed by a
//! conditional `Create`/`Update` — two round-trips with a race window in
//! between where two replicas can both believe they hold the lock. This
//! implementation instead attempts a single atomic `Create`; only on
//! conflict does it fall back to checking whether the existing holder is
//! already us (a renewal), via `CompareAndSwap` rather than a second
//! unconditional write.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::kv::KeyValueStore;

/// A held mutex. Dropping it does not release the lock — call `unlock`
/// explicitly, since releasing is a fallible KV operation.
pub struct Mutex {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    holder: Vec<u8>,
    renewer: Option<JoinHandle<()>>,
    lock_lost: watch::Receiver<bool>,
}

impl Mutex {
    /// Non-blocking lock attempt. Returns `Ok(None)` if another holder
    /// currently owns the resource; the caller retries on the next
    /// triggering event rather than blocking here.
    pub async fn lock(
        kv: Arc<dyn KeyValueStore>,
        resource: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Mutex>> {
        let holder = holder_id.as_bytes().to_vec();

        match kv.create(resource, holder.clone(), Some(ttl)).await {
            Ok(_) => {
                debug!(resource, holder_id, "acquired lock");
                return Ok(Some(Self::new(kv, resource, holder)));
            }
            Err(e) if !e.is_conflict() => return Err(e),
            Err(_) => {}
        }

        // Someone already holds it. If it's us, this is a renewal.
        let current = match kv.get(resource).await {
            Ok(node) => node.value,
            Err(e) if e.is_not_found() => {
                // Raced with the holder's own unlock between our failed
                // create and this get. Don't create afresh here: another
                // replica may already have done so and we'd silently
                // re-enter the critical section behind it. Report busy and
                // let the next triggering event retry cleanly.
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if current != holder {
            return Ok(None);
        }

        match kv.compare_and_swap(resource, &holder, holder.clone(), Some(ttl)).await {
            Ok(_) => {
                debug!(resource, holder_id, "renewed lock");
                Ok(Some(Self::new(kv, resource, holder)))
            }
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn new(kv: Arc<dyn KeyValueStore>, key: &str, holder: Vec<u8>) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            kv,
            key: key.to_owned(),
            holder,
            renewer: None,
            lock_lost: rx,
        }
    }

    /// Renews the lease for another `ttl`. Fails with `Error::Conflict` if
    /// we are no longer the holder.
    pub async fn renew(&self, ttl: Duration) -> Result<()> {
        self.kv
            .compare_and_swap(&self.key, &self.holder, self.holder.clone(), Some(ttl))
            .await?;
        Ok(())
    }

    /// Releases the lock, but only if we are still the holder.
    pub async fn unlock(self) -> Result<()> {
        if let Some(handle) = &self.renewer {
            handle.abort();
        }
        self.kv.compare_and_delete(&self.key, &self.holder).await
    }

    /// Spawns a background task that renews this lock at `interval` for as
    /// long as the mutex is held. On renewal failure it publishes a
    /// `LockLost` signal; the holding operation must check
    /// `lock_lost_signal` at its next checkpoint and abort rather than
    /// continuing to act as though it still holds the critical section.
    pub fn spawn_renewer(&mut self, ttl: Duration, interval: Duration) {
        let kv = self.kv.clone();
        let key = self.key.clone();
        let holder = self.holder.clone();
        let (tx, rx) = watch::channel(false);
        self.lock_lost = rx;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match kv.compare_and_swap(&key, &holder, holder.clone(), Some(ttl)).await {
                    Ok(_) => continue,
                    Err(Error::Conflict(_)) => {
                        warn!(resource = %key, "lost lock during renewal");
                        let _ = tx.send(true);
                        return;
                    }
                    Err(e) => {
                        warn!(resource = %key, error = %e, "transport error renewing lock");
                        let _ = tx.send(true);
                        return;
                    }
                }
            }
        });
        self.renewer = Some(handle);
    }

    /// `true` once the background renewer has observed that we no longer
    /// hold the lock. A handler performing a multi-round-trip critical
    /// section should check this between KV calls and abort if set.
    pub fn lock_lost(&self) -> bool {
        *self.lock_lost.borrow()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        if let Some(handle) = &self.renewer {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use std::sync::Arc;

    #[tokio::test]
    async fn second_locker_is_refused() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let a = Mutex::lock(kv.clone(), "/lock/r1", "machine-a", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(a.is_some());

        let b = Mutex::lock(kv.clone(), "/lock/r1", "machine-b", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn same_holder_reacquisition_is_a_renewal() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let a = Mutex::lock(kv.clone(), "/lock/r1", "machine-a", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        let again = Mutex::lock(kv.clone(), "/lock/r1", "machine-a", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(again.is_some());
        a.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn unlock_then_relock_by_other_succeeds() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let a = Mutex::lock(kv.clone(), "/lock/r1", "machine-a", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        a.unlock().await.unwrap();

        let b = Mutex::lock(kv.clone(), "/lock/r1", "machine-b", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_acquired_by_another_holder() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let _a = Mutex::lock(kv.clone(), "/lock/r1", "machine-a", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let b = Mutex::lock(kv.clone(), "/lock/r1", "machine-b", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(b.is_some());
    }
}
