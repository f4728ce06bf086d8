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

//! The scheduling operations themselves: `OfferJob`, `ResolveJobOffer`,
//! `UnscheduleJob`, `RemoveJob`. Each acquires the relevant resource
//! mutex, performs its work against the registry, and releases it;
//! contention is reported back as `Ok(None)` rather than awaited, since
//! the reactor will simply see the triggering event again on the next
//! replay.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tracing::{info, warn};

use crate::cluster::ClusterModel;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::metrics::{NoopMetricsCollector, SchedulerMetricsCollector};
use crate::model::{Job, JobOffer};
use crate::mutex::Mutex;
use crate::registry::Registry;

/// Errors specific to `ResolveJobOffer`'s verification sequence. All three
/// are recoverable and observable — a handler that sees one simply
/// returns and waits for the next triggering event.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no outstanding offer for job {0}")]
    NoOffer(String),
    #[error("no bid from {machine_id} for job {job_name}")]
    NoBid { job_name: String, machine_id: String },
    #[error("job {0} is already scheduled")]
    AlreadyScheduled(String),
    /// The offer mutex's renewer observed we no longer hold the lock
    /// before the resolution sequence finished; the caller should not
    /// trust that it still exclusively owned the critical section.
    #[error("lost the offer lock for job {0} mid-resolution")]
    LockLost(String),
    #[error(transparent)]
    Kv(#[from] Error),
}

fn offer_resource(job_name: &str) -> String {
    format!("offer/{}", job_name)
}

/// The scheduling core for a single replica. Holds no persistent state of
/// its own beyond a read side cache of the cluster model; all durable
/// state lives in the registry.
pub struct SchedulerCore {
    kv: Arc<dyn KeyValueStore>,
    registry: Registry,
    cluster: Arc<RwLock<ClusterModel>>,
    config: SchedulerConfig,
    holder_id: String,
    metrics: Arc<dyn SchedulerMetricsCollector>,
}

impl SchedulerCore {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        registry: Registry,
        cluster: Arc<RwLock<ClusterModel>>,
        config: SchedulerConfig,
        holder_id: impl Into<String>,
    ) -> Self {
        Self {
            kv,
            registry,
            cluster,
            config,
            holder_id: holder_id.into(),
            metrics: Arc::new(NoopMetricsCollector),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn SchedulerMetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<dyn SchedulerMetricsCollector> {
        &self.metrics
    }

    /// Count of jobs with no schedule record yet, for the
    /// `scheduler_pending_jobs` gauge.
    pub async fn pending_job_count(&self) -> Result<usize> {
        let mut count = 0;
        for job in self.registry.list_jobs().await? {
            if self.registry.get_schedule(&job.name).await?.is_none() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn lock(&self, resource: &str) -> Result<Option<Mutex>> {
        Mutex::lock(
            self.kv.clone(),
            &self.registry.lock_key(resource),
            &self.holder_id,
            self.config.lock_ttl,
        )
        .await
    }

    /// Computes candidates and publishes (or idempotently republishes) the
    /// offer for `job`. Returns `Ok(None)` if the job mutex could not be
    /// acquired — the caller should rely on the next `JobCreated` replay
    /// rather than retry here.
    pub async fn offer_job(&self, job: &Job) -> Result<Option<JobOffer>> {
        let resource = job.name.clone();
        let mutex = match self.lock(&resource).await? {
            Some(m) => m,
            None => {
                self.metrics.record_lock_denied(&resource);
                return Ok(None);
            }
        };

        // A job already scheduled never gets re-offered.
        if self.registry.get_schedule(&job.name).await?.is_some() {
            mutex.unlock().await?;
            return Ok(None);
        }

        let candidates = self.cluster.read().partition_cluster(job);
        let offer = JobOffer::new(job.clone(), candidates);
        self.registry.create_or_refresh_offer(&offer).await?;
        self.metrics
            .record_offer_published(&job.name, offer.machine_ids.len());
        info!(job = %job.name, candidates = offer.machine_ids.len(), "published job offer");

        mutex.unlock().await?;
        Ok(Some(offer))
    }

    /// Resolves an offer in favor of `machine_id`, the low-level operation
    /// exactly as named in the scheduling protocol: verifies the offer,
    /// the bid, and the absence of a prior schedule, then atomically
    /// claims the schedule slot. Holds the offer mutex across four KV
    /// round-trips, so it keeps the lock renewed in the background and
    /// aborts if the renewer ever reports the lock lost.
    pub async fn resolve_job_offer(
        &self,
        job_name: &str,
        machine_id: &str,
    ) -> std::result::Result<(), ResolveError> {
        let mut mutex = self
            .lock(&offer_resource(job_name))
            .await?
            .ok_or_else(|| ResolveError::NoOffer(job_name.to_owned()))?;
        mutex.spawn_renewer(self.config.lock_ttl, self.config.lock_renew_interval());

        let result = self.resolve_locked(job_name, machine_id, &mutex).await;
        mutex.unlock().await?;
        result
    }

    fn check_lock_lost(&self, job_name: &str, mutex: &Mutex) -> std::result::Result<(), ResolveError> {
        if mutex.lock_lost() {
            warn!(job = job_name, "offer lock lost mid-resolution, aborting");
            return Err(ResolveError::LockLost(job_name.to_owned()));
        }
        Ok(())
    }

    async fn resolve_locked(
        &self,
        job_name: &str,
        machine_id: &str,
        mutex: &Mutex,
    ) -> std::result::Result<(), ResolveError> {
        self.check_lock_lost(job_name, mutex)?;
        self.registry
            .get_offer(job_name)
            .await
            .map_err(|e| if e.is_not_found() {
                ResolveError::NoOffer(job_name.to_owned())
            } else {
                ResolveError::Kv(e)
            })?;

        self.check_lock_lost(job_name, mutex)?;
        if !self.registry.has_bid(job_name, machine_id).await? {
            return Err(ResolveError::NoBid {
                job_name: job_name.to_owned(),
                machine_id: machine_id.to_owned(),
            });
        }

        if self.registry.get_schedule(job_name).await?.is_some() {
            return Err(ResolveError::AlreadyScheduled(job_name.to_owned()));
        }

        self.check_lock_lost(job_name, mutex)?;
        match self.registry.schedule(job_name, machine_id).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                self.metrics.record_resolve_conflict(job_name);
                return Err(ResolveError::AlreadyScheduled(job_name.to_owned()));
            }
            Err(e) => return Err(ResolveError::Kv(e)),
        }

        self.check_lock_lost(job_name, mutex)?;
        self.registry.delete_offer(job_name).await?;
        self.registry.delete_all_bids(job_name).await?;
        self.metrics.record_offer_resolved(job_name, machine_id);
        info!(job = job_name, machine_id, "resolved job offer");
        Ok(())
    }

    /// Convenience for the reactor's `JobBidCreated` handler: lists all
    /// current bids for the offer and attempts resolution in favor of the
    /// lexicographically smallest machine ID, per the tie-break rule.
    /// Returns `Ok(None)` if there are no bids to resolve against yet.
    pub async fn attempt_resolve(
        &self,
        job_name: &str,
    ) -> std::result::Result<Option<String>, ResolveError> {
        let mut bids = self.registry.list_bids(job_name).await?;
        if bids.is_empty() {
            return Ok(None);
        }
        bids.sort();
        let winner = bids.into_iter().next().expect("checked non-empty above");

        match self.resolve_job_offer(job_name, &winner).await {
            Ok(()) => Ok(Some(winner)),
            Err(ResolveError::AlreadyScheduled(_)) => {
                warn!(job = job_name, "offer already resolved by a racing replica");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes the schedule record only. The job object, offer, and bids
    /// are left untouched.
    pub async fn unschedule_job(&self, job_name: &str) -> Result<()> {
        self.registry.unschedule(job_name).await
    }

    /// Deletes job object, offer, bids, and schedule, in the fixed order
    /// bids -> offer -> schedule -> job, so an observer never sees a
    /// schedule without a job. Each step retries with jittered backoff on
    /// a transport error before giving up; orphan reconciliation beyond
    /// that is left to the next `JobRemoved` replay.
    pub async fn remove_job(&self, job_name: &str) -> Result<()> {
        self.retry_step(|| self.registry.delete_all_bids(job_name)).await?;
        self.retry_step(|| self.registry.delete_offer(job_name)).await?;
        self.retry_step(|| self.registry.unschedule(job_name)).await?;
        self.retry_step(|| self.registry.remove_job_object(job_name)).await
    }

    async fn retry_step<F, Fut>(&self, step: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match step().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transport() && attempt < self.config.remove_job_max_attempts => {
                    warn!(attempt, error = %e, "remove_job step failed, retrying");
                    let jitter = {
                        let mut rng = rand::thread_rng();
                        rng.gen_range(Duration::from_millis(0)..=self.config.remove_job_retry_backoff)
                    };
                    tokio::time::sleep(self.config.remove_job_retry_backoff + jitter).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use crate::model::{Job, Requirements};

    fn make_core(kv: Arc<dyn KeyValueStore>, holder: &str) -> SchedulerCore {
        let registry = Registry::new(kv.clone(), "/fleet");
        SchedulerCore::new(
            kv,
            registry,
            Arc::new(RwLock::new(ClusterModel::new())),
            SchedulerConfig::default(),
            holder,
        )
    }

    fn job(name: &str) -> Job {
        Job {
            name: name.to_owned(),
            payload: String::new(),
            requirements: Requirements::default(),
        }
    }

    #[tokio::test]
    async fn offer_job_publishes_empty_offer_with_no_machines() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let core = make_core(kv.clone(), "replica-a");
        let registry = Registry::new(kv, "/fleet");
        registry.create_job(&job("j1")).await.unwrap();

        let offer = core.offer_job(&job("j1")).await.unwrap().unwrap();
        assert!(offer.machine_ids.is_empty());
    }

    #[tokio::test]
    async fn resolve_without_offer_fails() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let core = make_core(kv, "replica-a");

        let err = core.resolve_job_offer("j1", "m1").await.unwrap_err();
        assert!(matches!(err, ResolveError::NoOffer(_)));
    }

    #[tokio::test]
    async fn resolve_without_bid_fails() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let core = make_core(kv.clone(), "replica-a");
        let registry = Registry::new(kv, "/fleet");
        registry.create_job(&job("j1")).await.unwrap();
        core.offer_job(&job("j1")).await.unwrap();

        let err = core.resolve_job_offer("j1", "m1").await.unwrap_err();
        assert!(matches!(err, ResolveError::NoBid { .. }));
    }

    #[tokio::test]
    async fn resolve_picks_smallest_machine_id_among_bids() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let core = make_core(kv.clone(), "replica-a");
        let registry = Registry::new(kv, "/fleet");
        registry.create_job(&job("j1")).await.unwrap();
        core.offer_job(&job("j1")).await.unwrap();

        registry.create_bid("j1", "m2").await.unwrap();
        registry.create_bid("j1", "m1").await.unwrap();

        let winner = core.attempt_resolve("j1").await.unwrap();
        assert_eq!(winner, Some("m1".to_owned()));
        assert_eq!(
            registry.get_schedule("j1").await.unwrap(),
            Some("m1".to_owned())
        );
    }

    #[tokio::test]
    async fn racing_resolvers_only_one_wins() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let registry = Registry::new(kv.clone(), "/fleet");
        registry.create_job(&job("j1")).await.unwrap();

        let core_a = make_core(kv.clone(), "replica-a");
        core_a.offer_job(&job("j1")).await.unwrap();
        registry.create_bid("j1", "m1").await.unwrap();

        let core_b = make_core(kv.clone(), "replica-b");

        let a = core_a.resolve_job_offer("j1", "m1").await;
        let b = core_b.resolve_job_offer("j1", "m1").await;

        let outcomes: Vec<_> = vec![a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    }

    #[tokio::test]
    async fn remove_job_deletes_all_residue() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let core = make_core(kv.clone(), "replica-a");
        let registry = Registry::new(kv, "/fleet");
        registry.create_job(&job("j1")).await.unwrap();
        core.offer_job(&job("j1")).await.unwrap();
        registry.create_bid("j1", "m1").await.unwrap();

        core.remove_job("j1").await.unwrap();

        assert!(registry.get_job("j1").await.unwrap_err().is_not_found());
        assert!(registry.get_offer("j1").await.unwrap_err().is_not_found());
        assert!(registry.list_bids("j1").await.unwrap().is_empty());
    }
}
