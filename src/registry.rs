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

//! Owns all key formatting and (de)serialization against the KV store, and
//! translates raw KV change events into the closed set of domain events the
//! reactor dispatches on. The key layout below must be preserved
//! byte-for-byte by any reimplementation that wants to interoperate with an
//! existing cluster.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::kv::{ChangeEvent, ChangeKind, ChangeStream, KeyValueStore};
use crate::model::{Job, JobOffer, JobState, Machine, MachineAddrs, MachineId, JobName};

const MACHINES: &str = "machines";
const JOB: &str = "job";
const STATE: &str = "state";
const LOCK: &str = "lock";

/// A domain-level change, derived from a raw KV event by parsing its key
/// path. This is the closed set the event reactor dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    MachineCreated(Machine),
    MachineRemoved(MachineId),
    JobCreated(Job),
    JobRemoved(JobName),
    JobOfferCreated(JobOffer),
    JobBidCreated { job_name: JobName, machine_id: MachineId },
    JobScheduled { job_name: JobName, machine_id: MachineId },
    JobUnscheduled(JobName),
    JobStateUpdated { job_name: JobName, state: JobState },
}

#[derive(Clone)]
pub struct Registry {
    kv: Arc<dyn KeyValueStore>,
    root: String,
}

impl Registry {
    pub fn new(kv: Arc<dyn KeyValueStore>, root: impl Into<String>) -> Self {
        let mut root = root.into();
        if root.ends_with('/') {
            root.pop();
        }
        Self { kv, root }
    }

    fn machine_object_key(&self, id: &str) -> String {
        format!("{}/{}/{}/object", self.root, MACHINES, id)
    }

    fn machine_addrs_key(&self, id: &str) -> String {
        format!("{}/{}/{}/addrs", self.root, MACHINES, id)
    }

    fn machines_prefix(&self) -> String {
        format!("{}/{}/", self.root, MACHINES)
    }

    fn job_object_key(&self, name: &str) -> String {
        format!("{}/{}/{}/object", self.root, JOB, name)
    }

    fn job_target_key(&self, name: &str) -> String {
        format!("{}/{}/{}/target", self.root, JOB, name)
    }

    fn job_offer_key(&self, name: &str) -> String {
        format!("{}/{}/{}/offer", self.root, JOB, name)
    }

    fn job_bids_prefix(&self, name: &str) -> String {
        format!("{}/{}/{}/bids/", self.root, JOB, name)
    }

    fn job_bid_key(&self, name: &str, machine_id: &str) -> String {
        format!("{}/{}/{}/bids/{}", self.root, JOB, name, machine_id)
    }

    fn jobs_prefix(&self) -> String {
        format!("{}/{}/", self.root, JOB)
    }

    fn state_key(&self, name: &str) -> String {
        format!("{}/{}/{}", self.root, STATE, name)
    }

    pub fn lock_key(&self, resource: &str) -> String {
        format!("{}/{}/{}", self.root, LOCK, resource)
    }

    // -- machines --------------------------------------------------------

    pub async fn set_machine(&self, machine: &Machine) -> Result<()> {
        let value = serde_json::to_vec(machine).expect("Machine always serializes");
        self.kv
            .set(&self.machine_object_key(&machine.id), value, None)
            .await?;
        Ok(())
    }

    pub async fn set_machine_addrs(
        &self,
        id: &str,
        addrs: &MachineAddrs,
        ttl: Duration,
    ) -> Result<()> {
        let value = serde_json::to_vec(addrs).expect("MachineAddrs always serializes");
        self.kv
            .set(&self.machine_addrs_key(id), value, Some(ttl))
            .await?;
        Ok(())
    }

    pub async fn get_machine(&self, id: &str) -> Result<Machine> {
        let node = self.kv.get(&self.machine_object_key(id)).await?;
        parse(&node.key, &node.value)
    }

    /// Machines with a live (unexpired) `addrs` presence record.
    pub async fn list_active_machines(&self) -> Result<Vec<Machine>> {
        let addrs = self.kv.get_prefix(&self.machines_prefix()).await?;
        let ids: Vec<String> = addrs
            .into_iter()
            .filter(|n| n.key.ends_with("/addrs"))
            .filter_map(|n| machine_id_from_key(&n.key, &self.machines_prefix()))
            .collect();

        let mut machines = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_machine(&id).await {
                Ok(machine) => machines.push(machine),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(machines)
    }

    // -- jobs --------------------------------------------------------------

    /// Creates a job. Fails with `Error::Conflict` if the name is already
    /// taken, per the "immutable once submitted" invariant.
    pub async fn create_job(&self, job: &Job) -> Result<()> {
        let value = serde_json::to_vec(job).expect("Job always serializes");
        self.kv.create(&self.job_object_key(&job.name), value, None).await?;
        Ok(())
    }

    pub async fn get_job(&self, name: &str) -> Result<Job> {
        let node = self.kv.get(&self.job_object_key(name)).await?;
        parse(&node.key, &node.value)
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let nodes = self.kv.get_prefix(&self.jobs_prefix()).await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.key.ends_with("/object"))
            .filter_map(|n| parse::<Job>(&n.key, &n.value).ok())
            .collect())
    }

    // -- offers & bids -------------------------------------------------

    /// Publishes an offer. Idempotent when the candidate set is unchanged
    /// and nothing is scheduled yet: the caller is expected to check
    /// `get_schedule` before calling this, per `OfferJob`'s contract.
    pub async fn create_or_refresh_offer(&self, offer: &JobOffer) -> Result<()> {
        let value = serde_json::to_vec(offer).expect("JobOffer always serializes");
        self.kv
            .set(&self.job_offer_key(&offer.job.name), value, None)
            .await?;
        Ok(())
    }

    pub async fn get_offer(&self, name: &str) -> Result<JobOffer> {
        let node = self.kv.get(&self.job_offer_key(name)).await?;
        parse(&node.key, &node.value)
    }

    pub async fn delete_offer(&self, name: &str) -> Result<()> {
        self.kv.delete(&self.job_offer_key(name)).await
    }

    pub async fn list_bids(&self, name: &str) -> Result<Vec<MachineId>> {
        let nodes = self.kv.get_prefix(&self.job_bids_prefix(name)).await?;
        let prefix = self.job_bids_prefix(name);
        Ok(nodes
            .into_iter()
            .filter_map(|n| n.key.strip_prefix(&prefix).map(|s| s.to_owned()))
            .collect())
    }

    pub async fn has_bid(&self, name: &str, machine_id: &str) -> Result<bool> {
        match self.kv.get(&self.job_bid_key(name, machine_id)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn create_bid(&self, name: &str, machine_id: &str) -> Result<()> {
        self.kv
            .set(&self.job_bid_key(name, machine_id), Vec::new(), None)
            .await?;
        Ok(())
    }

    pub async fn delete_all_bids(&self, name: &str) -> Result<()> {
        self.kv.delete_prefix(&self.job_bids_prefix(name)).await
    }

    // -- schedule ------------------------------------------------------

    /// Writes the schedule record with `Create`, never `Set`, so a
    /// concurrent racer's write observes `Error::Conflict` instead of
    /// silently overwriting a previous decision.
    pub async fn schedule(&self, name: &str, machine_id: &str) -> Result<()> {
        self.kv
            .create(&self.job_target_key(name), machine_id.as_bytes().to_vec(), None)
            .await?;
        Ok(())
    }

    pub async fn get_schedule(&self, name: &str) -> Result<Option<MachineId>> {
        match self.kv.get(&self.job_target_key(name)).await {
            Ok(node) => Ok(Some(String::from_utf8_lossy(&node.value).into_owned())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn unschedule(&self, name: &str) -> Result<()> {
        self.kv.delete(&self.job_target_key(name)).await
    }

    // -- removal ---------------------------------------------------------

    /// Deletes the job object itself. Callers wanting full removal of a
    /// job's residue (bids, offer, schedule, then the object) should
    /// delete those first, in that order; see `SchedulerCore::remove_job`,
    /// which retries each step independently.
    pub async fn remove_job_object(&self, name: &str) -> Result<()> {
        self.kv.delete(&self.job_object_key(name)).await
    }

    // -- job state (advisory) ---------------------------------------------

    pub async fn save_job_state(&self, name: &str, state: &JobState, ttl: Duration) -> Result<()> {
        let value = serde_json::to_vec(state).expect("JobState always serializes");
        self.kv.set(&self.state_key(name), value, Some(ttl)).await?;
        Ok(())
    }

    pub async fn get_job_state(&self, name: &str) -> Result<Option<JobState>> {
        match self.kv.get(&self.state_key(name)).await {
            Ok(node) => Ok(Some(parse(&node.key, &node.value)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The largest modification index currently observed anywhere under
    /// this registry's root. A freshly started reactor reads this after
    /// taking its startup snapshot, then resumes the live watch from
    /// exactly this point.
    pub async fn max_modification_index(&self) -> Result<u64> {
        let root_prefix = format!("{}/", self.root);
        let nodes = self.kv.get_prefix(&root_prefix).await?;
        Ok(nodes.iter().map(|n| n.modification_index).max().unwrap_or(0))
    }

    // -- event stream ------------------------------------------------------

    /// Streams `(modification_index, DomainEvent)` pairs derived from raw
    /// KV changes under this registry's root, starting strictly after
    /// `from_index`. The index is threaded through so a caller can resume
    /// a dropped watch from exactly where it left off.
    pub async fn event_stream(&self, from_index: u64) -> Result<DomainEventStream> {
        let root_prefix = format!("{}/", self.root);
        let raw = self.kv.watch(&root_prefix, from_index).await?;
        let registry = self.clone();
        let stream = raw.filter_map(move |event| {
            let registry = registry.clone();
            async move {
                match event {
                    Ok(event) => {
                        let index = event.modification_index;
                        registry
                            .translate(event)
                            .await
                            .map(|result| result.map(|domain_event| (index, domain_event)))
                    }
                    Err(e) => {
                        warn!(error = %e, "watch stream error");
                        Some(Err(e))
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn translate(&self, event: ChangeEvent) -> Option<Result<DomainEvent>> {
        let suffix = event.key.strip_prefix(&format!("{}/", self.root))?;
        let mut parts = suffix.splitn(2, '/');
        let category = parts.next()?;
        let rest = parts.next().unwrap_or("");

        trace!(key = %event.key, kind = ?event.kind, "translating KV event");

        match category {
            MACHINES => self.translate_machine(rest, &event).await,
            JOB => self.translate_job(rest, &event),
            STATE => self.translate_state(rest, &event),
            LOCK => None,
            _ => {
                debug!(key = %event.key, "dropping unknown key path");
                None
            }
        }
    }

    async fn translate_machine(
        &self,
        rest: &str,
        event: &ChangeEvent,
    ) -> Option<Result<DomainEvent>> {
        let (id, field) = rest.split_once('/')?;
        if field != "addrs" {
            return None;
        }
        match event.kind {
            // Both a fresh lease and a renewal can be the first sighting of
            // a machine: the object and addrs keys are written by separate
            // calls with no ordering guarantee, so an Update observed before
            // the object record exists must be retried the same as Create.
            // `seed_machine` upserts, so re-emitting MachineCreated on every
            // renewal of an already-known machine is harmless.
            ChangeKind::Create | ChangeKind::Update => match self.get_machine(id).await {
                Ok(machine) => Some(Ok(DomainEvent::MachineCreated(machine))),
                Err(e) if e.is_not_found() => None,
                Err(e) => Some(Err(e)),
            },
            ChangeKind::Delete | ChangeKind::Expire => {
                Some(Ok(DomainEvent::MachineRemoved(id.to_owned())))
            }
        }
    }

    fn translate_job(&self, rest: &str, event: &ChangeEvent) -> Option<Result<DomainEvent>> {
        let (name, field) = rest.split_once('/')?;
        match field {
            "object" => match event.kind {
                ChangeKind::Create => {
                    let value = event.new_value.as_deref()?;
                    Some(parse(&event.key, value).map(DomainEvent::JobCreated))
                }
                ChangeKind::Delete | ChangeKind::Expire => {
                    Some(Ok(DomainEvent::JobRemoved(name.to_owned())))
                }
                ChangeKind::Update => None,
            },
            "target" => match event.kind {
                ChangeKind::Create | ChangeKind::Update => {
                    let value = event.new_value.as_deref()?;
                    Some(Ok(DomainEvent::JobScheduled {
                        job_name: name.to_owned(),
                        machine_id: String::from_utf8_lossy(value).into_owned(),
                    }))
                }
                ChangeKind::Delete | ChangeKind::Expire => {
                    Some(Ok(DomainEvent::JobUnscheduled(name.to_owned())))
                }
            },
            "offer" => match event.kind {
                ChangeKind::Create => {
                    let value = event.new_value.as_deref()?;
                    Some(parse(&event.key, value).map(DomainEvent::JobOfferCreated))
                }
                _ => None,
            },
            _ if field.starts_with("bids/") => match event.kind {
                ChangeKind::Create => {
                    let machine_id = field.strip_prefix("bids/")?.to_owned();
                    Some(Ok(DomainEvent::JobBidCreated {
                        job_name: name.to_owned(),
                        machine_id,
                    }))
                }
                _ => None,
            },
            _ => None,
        }
    }

    fn translate_state(&self, name: &str, event: &ChangeEvent) -> Option<Result<DomainEvent>> {
        match event.kind {
            ChangeKind::Create | ChangeKind::Update => {
                let value = event.new_value.as_deref()?;
                Some(parse(&event.key, value).map(|state| DomainEvent::JobStateUpdated {
                    job_name: name.to_owned(),
                    state,
                }))
            }
            ChangeKind::Delete | ChangeKind::Expire => None,
        }
    }
}

pub type DomainEventStream =
    std::pin::Pin<Box<dyn futures::Stream<Item = Result<(u64, DomainEvent)>> + Send>>;

fn parse<T: serde::de::DeserializeOwned>(key: &str, value: &[u8]) -> Result<T> {
    serde_json::from_slice(value).map_err(|source| Error::MalformedRecord {
        key: key.to_owned(),
        source,
    })
}

fn machine_id_from_key(key: &str, prefix: &str) -> Option<String> {
    key.strip_prefix(prefix)?
        .strip_suffix("/addrs")
        .map(|s| s.to_owned())
}
