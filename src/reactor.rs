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

//! The single-threaded cooperative event loop each scheduler replica
//! runs. Reimplements the teacher's named-event-loop-with-a-sender
//! pattern as a closed `DomainEvent` dispatch table: no dynamic listener
//! registry, since every event this reactor cares about belongs to the
//! scheduler core.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::cluster::ClusterModel;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::registry::{DomainEvent, DomainEventStream, Registry};
use crate::scheduler::SchedulerCore;

/// Drives one replica's reactor to completion (normally: until the stop
/// signal fires). `run` does not return until then, so callers typically
/// `tokio::spawn` it.
pub struct EventReactor {
    registry: Registry,
    cluster: Arc<RwLock<ClusterModel>>,
    scheduler: Arc<SchedulerCore>,
    config: SchedulerConfig,
    stop: watch::Receiver<bool>,
}

impl EventReactor {
    pub fn new(
        registry: Registry,
        cluster: Arc<RwLock<ClusterModel>>,
        scheduler: Arc<SchedulerCore>,
        config: SchedulerConfig,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            cluster,
            scheduler,
            config,
            stop,
        }
    }

    /// Reads the current KV state, synthesizes `*Created` events for every
    /// live entity, applies them to the cluster model, and returns the
    /// largest modification index observed so the live watch can resume
    /// from exactly that point. A freshly started replica that runs this
    /// before entering `run` reaches the same decisions a long-running
    /// one would have.
    pub async fn snapshot(&self) -> Result<u64> {
        for machine in self.registry.list_active_machines().await? {
            self.cluster.write().seed_machine(machine);
        }

        for job in self.registry.list_jobs().await? {
            if let Some(machine_id) = self.registry.get_schedule(&job.name).await? {
                self.cluster.write().seed_schedule(job.name.clone(), machine_id);
            }
        }

        self.scheduler
            .metrics()
            .set_active_machines(self.cluster.read().machine_count() as u64);
        self.scheduler
            .metrics()
            .set_pending_jobs(self.scheduler.pending_job_count().await? as u64);

        self.registry.max_modification_index().await
    }

    /// Runs the reactor loop until the stop signal fires. Each event is
    /// dispatched synchronously; there is no parallel handling within a
    /// replica. The raw watch stream is drained by a forwarder task into a
    /// channel bounded by `config.event_queue_capacity`, so a reactor that
    /// falls behind applies backpressure to the watch rather than buffering
    /// an unbounded backlog in memory.
    pub async fn run(&mut self) -> Result<()> {
        let mut from_index = self.snapshot().await?;

        'outer: loop {
            let stream = match self.registry.event_stream(from_index).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "failed to start watch, backing off");
                    self.backoff().await;
                    continue 'outer;
                }
            };

            let (tx, mut rx) = mpsc::channel(self.config.event_queue_capacity);
            let forwarder = tokio::spawn(forward_stream(stream, tx));

            loop {
                tokio::select! {
                    biased;
                    _ = self.stop.changed() => {
                        if *self.stop.borrow() {
                            debug!("stop signal received, draining reactor");
                            forwarder.abort();
                            break 'outer;
                        }
                    }
                    item = rx.recv() => {
                        match item {
                            Some(Ok((index, event))) => {
                                from_index = from_index.max(index);
                                self.dispatch(event).await;
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "watch stream error, restarting from last index");
                                forwarder.abort();
                                self.backoff().await;
                                continue 'outer;
                            }
                            None => {
                                warn!("watch stream ended, restarting");
                                forwarder.abort();
                                self.backoff().await;
                                continue 'outer;
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn backoff(&self) {
        let jitter = {
            let mut rng = rand::thread_rng();
            rng.gen_range(self.config.watch_backoff_min..=self.config.watch_backoff_max)
        };
        tokio::time::sleep(jitter).await;
    }

    /// `pub(crate)` so scenario tests can dispatch a single synthesized
    /// event without running the whole `run` loop.
    pub(crate) async fn dispatch(&self, event: DomainEvent) {
        let result = match &event {
            DomainEvent::MachineCreated(machine) => {
                self.cluster.write().seed_machine(machine.clone());
                self.reoffer_unscheduled_jobs().await
            }
            DomainEvent::MachineRemoved(machine_id) => {
                self.handle_machine_removed(machine_id).await
            }
            DomainEvent::JobCreated(job) => self.scheduler.offer_job(job).await.map(|_| ()),
            DomainEvent::JobRemoved(job_name) => self.handle_job_removed(job_name).await,
            DomainEvent::JobOfferCreated(_) => Ok(()),
            DomainEvent::JobBidCreated { job_name, .. } => {
                self.scheduler
                    .attempt_resolve(job_name)
                    .await
                    .map(|_| ())
                    .or_else(|e| self.swallow_resolve_error(job_name, e))
            }
            DomainEvent::JobScheduled { .. } | DomainEvent::JobUnscheduled(_) => {
                self.cluster.write().apply(&event);
                Ok(())
            }
            DomainEvent::JobStateUpdated { .. } => Ok(()),
        };

        if let Err(e) = result {
            warn!(error = %e, event = ?event, "handler error, swallowed; recovery is via replay");
        }

        self.report_gauges(&event).await;
    }

    /// Refreshes the active-machines and pending-jobs gauges after an event
    /// that could have moved either count.
    async fn report_gauges(&self, event: &DomainEvent) {
        match event {
            DomainEvent::MachineCreated(_) | DomainEvent::MachineRemoved(_) => {
                let count = self.cluster.read().machine_count() as u64;
                self.scheduler.metrics().set_active_machines(count);
            }
            DomainEvent::JobCreated(_)
            | DomainEvent::JobRemoved(_)
            | DomainEvent::JobScheduled { .. }
            | DomainEvent::JobUnscheduled(_) => {
                match self.scheduler.pending_job_count().await {
                    Ok(count) => self.scheduler.metrics().set_pending_jobs(count as u64),
                    Err(e) => warn!(error = %e, "failed to refresh pending job gauge"),
                }
            }
            _ => {}
        }
    }

    fn swallow_resolve_error(
        &self,
        job_name: &str,
        err: crate::scheduler::ResolveError,
    ) -> Result<()> {
        use crate::scheduler::ResolveError::*;
        match err {
            NoOffer(_) | NoBid { .. } | AlreadyScheduled(_) => {
                debug!(job = job_name, error = %err, "resolve attempt deferred");
                Ok(())
            }
            LockLost(_) => {
                warn!(job = job_name, error = %err, "resolve attempt lost its lock, will retry on next event");
                Ok(())
            }
            Kv(e) => Err(e),
        }
    }

    async fn handle_machine_removed(&self, machine_id: &str) -> Result<()> {
        let orphaned: Vec<String> = {
            let mut cluster = self.cluster.write();
            let orphaned = cluster.jobs_on(machine_id);
            cluster.apply(&DomainEvent::MachineRemoved(machine_id.to_owned()));
            orphaned
        };

        for job_name in orphaned {
            self.scheduler.unschedule_job(&job_name).await?;
            if let Ok(job) = self.registry.get_job(&job_name).await {
                self.scheduler.offer_job(&job).await?;
            }
        }
        Ok(())
    }

    async fn handle_job_removed(&self, job_name: &str) -> Result<()> {
        // Best-effort: the job object is already gone; clean up whatever
        // residue (offer, bids, schedule) remains.
        match self.scheduler.remove_job(job_name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Re-offers jobs that have no schedule and no (or an empty) offer, in
    /// case the newly created machine unblocks their constraints.
    async fn reoffer_unscheduled_jobs(&self) -> Result<()> {
        for job in self.registry.list_jobs().await? {
            if self.registry.get_schedule(&job.name).await?.is_some() {
                continue;
            }
            self.scheduler.offer_job(&job).await?;
        }
        Ok(())
    }
}

/// Drains the raw watch stream into a bounded channel. Exits quietly once
/// the receiving end (the reactor loop, on stop or reconnect) drops.
async fn forward_stream(mut stream: DomainEventStream, tx: mpsc::Sender<Result<(u64, DomainEvent)>>) {
    while let Some(item) = stream.next().await {
        if tx.send(item).await.is_err() {
            return;
        }
    }
}
