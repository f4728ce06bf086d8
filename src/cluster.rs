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

//! An in-memory view of the fleet, kept current by replaying
//! [`DomainEvent`]s from the registry. The only question this model
//! answers is [`ClusterModel::partition_cluster`]: the candidate machine
//! set for a job.
//!
//! The cluster model and the jobs it schedules reference each other
//! (machine -> jobs it hosts, job -> peers it must co-reside with), which
//! would naturally want a persisted object graph. Instead this keeps an
//! arena of opaque `MachineID`/`JobName` strings plus a `jobs_by_machine`
//! secondary index (also used to resolve peer constraints, since a peer
//! lookup is just "which machine runs this job name"), so nothing here
//! needs back-pointers or reference counting.

use std::collections::{HashMap, HashSet};

use crate::model::{Job, JobName, Machine, MachineId};
use crate::registry::DomainEvent;

#[derive(Debug, Clone)]
struct MachineEntry {
    machine: Machine,
    jobs: HashSet<JobName>,
}

/// The fleet as seen by this replica. Eventually consistent with the KV
/// store; callers tolerate stale snapshots because the offer/bid
/// round-trip re-validates placement on the agent side.
#[derive(Debug, Default)]
pub struct ClusterModel {
    machines: HashMap<MachineId, MachineEntry>,
    /// job name -> machine currently running it, derived from `JobScheduled`
    /// / `JobUnscheduled` events.
    jobs_by_machine: HashMap<JobName, MachineId>,
}

impl ClusterModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the model from a startup snapshot, before live events start
    /// flowing. Safe to call repeatedly; later calls overwrite matching
    /// entries.
    pub fn seed_machine(&mut self, machine: Machine) {
        self.machines
            .entry(machine.id.clone())
            .and_modify(|entry| entry.machine = machine.clone())
            .or_insert_with(|| MachineEntry {
                machine,
                jobs: HashSet::new(),
            });
    }

    pub fn seed_schedule(&mut self, job_name: JobName, machine_id: MachineId) {
        self.apply_schedule(&job_name, &machine_id);
    }

    /// Applies a single domain event to the model. Events outside the set
    /// this model cares about (job creation/removal, offers, bids, state
    /// reports) are ignored.
    pub fn apply(&mut self, event: &DomainEvent) {
        match event {
            DomainEvent::MachineCreated(machine) => self.seed_machine(machine.clone()),
            DomainEvent::MachineRemoved(id) => {
                self.machines.remove(id);
            }
            DomainEvent::JobScheduled { job_name, machine_id } => {
                self.apply_schedule(job_name, machine_id);
            }
            DomainEvent::JobUnscheduled(job_name) => {
                self.clear_schedule(job_name);
            }
            DomainEvent::JobRemoved(job_name) => {
                self.clear_schedule(job_name);
            }
            _ => {}
        }
    }

    fn apply_schedule(&mut self, job_name: &str, machine_id: &str) {
        self.clear_schedule(job_name);
        if let Some(entry) = self.machines.get_mut(machine_id) {
            entry.jobs.insert(job_name.to_owned());
        }
        self.jobs_by_machine
            .insert(job_name.to_owned(), machine_id.to_owned());
    }

    fn clear_schedule(&mut self, job_name: &str) {
        if let Some(machine_id) = self.jobs_by_machine.remove(job_name) {
            if let Some(entry) = self.machines.get_mut(&machine_id) {
                entry.jobs.remove(job_name);
            }
        }
    }

    /// The machine a job is currently scheduled on, if any.
    pub fn machine_for_job(&self, job_name: &str) -> Option<&MachineId> {
        self.jobs_by_machine.get(job_name)
    }

    /// Count of machines with a live presence record, for the
    /// `scheduler_active_machines` gauge.
    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    /// The jobs currently assigned to `machine_id`, per that machine's
    /// secondary index. Empty if the machine is unknown or hosts nothing.
    pub fn jobs_on(&self, machine_id: &str) -> Vec<JobName> {
        self.machines
            .get(machine_id)
            .map(|entry| entry.jobs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The machine currently hosting `job_name`, if any — used to resolve
    /// peer constraints, one required peer at a time.
    fn machines_hosting(&self, job_name: &str) -> Option<&MachineId> {
        self.jobs_by_machine.get(job_name)
    }

    /// The six-step candidate-set computation.
    pub fn partition_cluster(&self, job: &Job) -> Vec<MachineId> {
        // 1. Start with all active machines.
        let mut candidates: Vec<&MachineEntry> = self.machines.values().collect();

        // 2. Drop machines whose metadata fails the job's required
        // predicates: for every required key, the machine must carry that
        // key with at least one overlapping value.
        candidates.retain(|entry| matches_predicates(&entry.machine, job));

        // 3. If the job pins a specific machine ID, restrict to it (or
        // return empty).
        if let Some(pinned) = &job.requirements.machine_id {
            return match candidates.iter().find(|entry| &entry.machine.id == pinned) {
                Some(entry) => vec![entry.machine.id.clone()],
                None => Vec::new(),
            };
        }

        // 4. Drop machines hosting any member of the conflict set.
        candidates.retain(|entry| {
            !job.requirements
                .conflicts
                .iter()
                .any(|conflict| entry.jobs.contains(conflict))
        });

        // 5. For peer constraints, restrict to machines already hosting
        // every named peer job.
        for peer in &job.requirements.peers {
            match self.machines_hosting(peer) {
                Some(host) => candidates.retain(|entry| &entry.machine.id == host),
                None => return Vec::new(),
            }
        }

        // 6. Empty set falls through as empty; the caller publishes the
        // offer anyway.
        candidates
            .into_iter()
            .map(|entry| entry.machine.id.clone())
            .collect()
    }
}

fn matches_predicates(machine: &Machine, job: &Job) -> bool {
    job.requirements.metadata.iter().all(|(key, wanted)| {
        machine
            .metadata
            .get(key)
            .map(|have| wanted.iter().any(|value| have.contains(value)))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Requirements;
    use std::collections::HashMap;

    fn machine(id: &str, metadata: &[(&str, &[&str])]) -> Machine {
        let mut map = HashMap::new();
        for (k, vs) in metadata {
            map.insert(k.to_string(), vs.iter().map(|v| v.to_string()).collect());
        }
        Machine {
            id: id.to_owned(),
            metadata: map,
        }
    }

    fn job(name: &str, requirements: Requirements) -> Job {
        Job {
            name: name.to_owned(),
            payload: String::new(),
            requirements,
        }
    }

    #[test]
    fn no_constraints_returns_all_active_machines() {
        let mut model = ClusterModel::new();
        model.seed_machine(machine("m1", &[]));
        model.seed_machine(machine("m2", &[]));

        let mut result = model.partition_cluster(&job("j1", Requirements::default()));
        result.sort();
        assert_eq!(result, vec!["m1".to_owned(), "m2".to_owned()]);
    }

    #[test]
    fn metadata_predicate_filters_non_matching_machines() {
        let mut model = ClusterModel::new();
        model.seed_machine(machine("m1", &[("region", &["us-east"])]));
        model.seed_machine(machine("m2", &[("region", &["us-west"])]));

        let mut req = Requirements::default();
        req.metadata
            .insert("region".to_owned(), vec!["us-east".to_owned()]);

        let result = model.partition_cluster(&job("j1", req));
        assert_eq!(result, vec!["m1".to_owned()]);
    }

    #[test]
    fn pinned_machine_not_in_fleet_yields_empty() {
        let mut model = ClusterModel::new();
        model.seed_machine(machine("m1", &[]));

        let mut req = Requirements::default();
        req.machine_id = Some("nope".to_owned());

        let result = model.partition_cluster(&job("j2", req));
        assert!(result.is_empty());
    }

    #[test]
    fn conflict_set_excludes_hosting_machine() {
        let mut model = ClusterModel::new();
        model.seed_machine(machine("m1", &[]));
        model.seed_schedule("j4".to_owned(), "m1".to_owned());

        let mut req = Requirements::default();
        req.conflicts.push("j4".to_owned());

        let result = model.partition_cluster(&job("j3", req));
        assert!(result.is_empty());
    }

    #[test]
    fn peer_constraint_restricts_to_hosting_machine() {
        let mut model = ClusterModel::new();
        model.seed_machine(machine("m1", &[]));
        model.seed_machine(machine("m2", &[]));
        model.seed_schedule("peer-job".to_owned(), "m1".to_owned());

        let mut req = Requirements::default();
        req.peers.push("peer-job".to_owned());

        let result = model.partition_cluster(&job("j5", req));
        assert_eq!(result, vec!["m1".to_owned()]);
    }

    #[test]
    fn unmet_peer_constraint_yields_empty() {
        let mut model = ClusterModel::new();
        model.seed_machine(machine("m1", &[]));

        let mut req = Requirements::default();
        req.peers.push("never-scheduled".to_owned());

        let result = model.partition_cluster(&job("j6", req));
        assert!(result.is_empty());
    }

    #[test]
    fn machine_removed_drops_out_of_candidates() {
        let mut model = ClusterModel::new();
        model.seed_machine(machine("m1", &[]));
        model.apply(&DomainEvent::MachineRemoved("m1".to_owned()));

        let result = model.partition_cluster(&job("j1", Requirements::default()));
        assert!(result.is_empty());
    }
}
