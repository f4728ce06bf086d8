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

//! A cluster-wide unit scheduler. Job specifications submitted by clients
//! are placed onto machines in a dynamic fleet through an offer/bid
//! protocol, coordinated entirely through a linearizable KV store so that
//! multiple scheduler replicas can run concurrently without an
//! in-process consensus layer of their own.
//!
//! A replica is assembled from the pieces in this crate roughly as:
//!
//! ```ignore
//! let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
//! let registry = Registry::new(kv.clone(), "/fleet");
//! let cluster = Arc::new(RwLock::new(ClusterModel::new()));
//! let scheduler = Arc::new(SchedulerCore::new(kv, registry.clone(), cluster.clone(), config.clone(), replica_id));
//! let mut reactor = EventReactor::new(registry, cluster, scheduler, config, stop_rx);
//! reactor.run().await?;
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod kv;
pub mod metrics;
pub mod model;
pub mod mutex;
pub mod reactor;
pub mod registry;
pub mod scheduler;

pub use cluster::ClusterModel;
pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use kv::KeyValueStore;
pub use mutex::Mutex;
pub use reactor::EventReactor;
pub use registry::{DomainEvent, Registry};
pub use scheduler::{ResolveError, SchedulerCore};

#[cfg(test)]
mod scenarios;
