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

//! Wire structs stored under the registry's key tree. These are the JSON
//! schemas in spec §6 and must not change field names or casing — existing
//! clusters' agents depend on them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type MachineId = String;
pub type JobName = String;

/// A machine's declared metadata labels, matched against a job's
/// `Requirements.Metadata` predicates.
pub type Metadata = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Machine {
    #[serde(rename = "ID")]
    pub id: MachineId,
    #[serde(rename = "Metadata", default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineAddrs {
    #[serde(rename = "Addresses", default)]
    pub addresses: Vec<String>,
}

/// A job's declarative scheduling constraints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Requirements {
    #[serde(rename = "Metadata", default)]
    pub metadata: Metadata,
    #[serde(rename = "Peers", default)]
    pub peers: Vec<JobName>,
    #[serde(rename = "Conflicts", default)]
    pub conflicts: Vec<JobName>,
    #[serde(rename = "MachineID", default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<MachineId>,
}

/// A client-submitted job. `payload` is opaque to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    #[serde(rename = "Name")]
    pub name: JobName,
    #[serde(rename = "Payload")]
    pub payload: String,
    #[serde(rename = "Requirements", default)]
    pub requirements: Requirements,
}

/// A published scheduling offer: the job plus the candidate machines
/// computed for it at offer time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOffer {
    #[serde(rename = "Job")]
    pub job: Job,
    #[serde(rename = "MachineIDs")]
    pub machine_ids: Vec<MachineId>,
}

impl JobOffer {
    pub fn new(job: Job, machine_ids: Vec<MachineId>) -> Self {
        Self { job, machine_ids }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LoadState {
    #[serde(rename = "inactive")]
    Inactive,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunState {
    #[serde(rename = "loaded")]
    Loaded,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "stopped")]
    Stopped,
}

/// Advisory, TTL'd report from the agent currently running a job. Never
/// consulted for placement decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobState {
    #[serde(rename = "LoadState")]
    pub load_state: LoadState,
    #[serde(rename = "JobState")]
    pub job_state: RunState,
    #[serde(rename = "Sockets", default)]
    pub sockets: Vec<String>,
}
