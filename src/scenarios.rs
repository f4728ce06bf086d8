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

//! End-to-end scenario tests driving the full stack (registry, cluster
//! model, scheduler core, reactor dispatch) against `MemoryKv`, one per
//! named scenario.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::cluster::ClusterModel;
use crate::config::SchedulerConfig;
use crate::kv::memory::MemoryKv;
use crate::kv::KeyValueStore;
use crate::model::{Job, Machine, MachineAddrs, Requirements};
use crate::mutex::Mutex;
use crate::reactor::EventReactor;
use crate::registry::{DomainEvent, Registry};
use crate::scheduler::{ResolveError, SchedulerCore};

struct Replica {
    registry: Registry,
    cluster: Arc<RwLock<ClusterModel>>,
    scheduler: Arc<SchedulerCore>,
    reactor: EventReactor,
}

fn build_replica(kv: Arc<dyn KeyValueStore>, holder_id: &str) -> Replica {
    let registry = Registry::new(kv.clone(), "/fleet");
    let cluster = Arc::new(RwLock::new(ClusterModel::new()));
    let config = SchedulerConfig::default();
    let scheduler = Arc::new(SchedulerCore::new(
        kv,
        registry.clone(),
        cluster.clone(),
        config.clone(),
        holder_id,
    ));
    let (_stop_tx, stop_rx) = watch::channel(false);
    let reactor = EventReactor::new(
        registry.clone(),
        cluster.clone(),
        scheduler.clone(),
        config,
        stop_rx,
    );
    Replica {
        registry,
        cluster,
        scheduler,
        reactor,
    }
}

async fn add_machine(registry: &Registry, id: &str) {
    registry
        .set_machine(&Machine {
            id: id.to_owned(),
            metadata: Default::default(),
        })
        .await
        .unwrap();
    registry
        .set_machine_addrs(
            id,
            &MachineAddrs {
                addresses: vec![format!("{id}.local:1234")],
            },
            Duration::from_secs(60),
        )
        .await
        .unwrap();
}

// Run tests with: RUST_LOG=debug cargo test -- --nocapture
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn job(name: &str, requirements: Requirements) -> Job {
    Job {
        name: name.to_owned(),
        payload: String::new(),
        requirements,
    }
}

/// Single-job, single-machine: a bid resolves to a schedule and the
/// offer/bid residue is cleaned up.
#[tokio::test]
async fn single_job_single_machine() {
    init_tracing();
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let replica = build_replica(kv, "replica-a");
    add_machine(&replica.registry, "m1").await;
    replica.cluster.write().seed_machine(Machine {
        id: "m1".to_owned(),
        metadata: Default::default(),
    });

    let j1 = job("j1", Requirements::default());
    replica.registry.create_job(&j1).await.unwrap();
    replica.scheduler.offer_job(&j1).await.unwrap();
    replica.registry.create_bid("j1", "m1").await.unwrap();

    let winner = replica.scheduler.attempt_resolve("j1").await.unwrap();
    assert_eq!(winner, Some("m1".to_owned()));

    assert_eq!(
        replica.registry.get_schedule("j1").await.unwrap(),
        Some("m1".to_owned())
    );
    assert!(replica.registry.get_offer("j1").await.unwrap_err().is_not_found());
    assert!(replica.registry.list_bids("j1").await.unwrap().is_empty());
}

/// Racing resolvers: two replicas both try to resolve the same offer in
/// favor of the same machine; exactly one schedule write succeeds.
#[tokio::test]
async fn racing_resolvers() {
    init_tracing();
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let a = build_replica(kv.clone(), "replica-a");
    let b = build_replica(kv.clone(), "replica-b");

    let j1 = job("j1", Requirements::default());
    a.registry.create_job(&j1).await.unwrap();
    a.scheduler.offer_job(&j1).await.unwrap();
    a.registry.create_bid("j1", "m1").await.unwrap();

    let (ra, rb) = tokio::join!(
        a.scheduler.resolve_job_offer("j1", "m1"),
        b.scheduler.resolve_job_offer("j1", "m1"),
    );

    let successes = [ra.is_ok(), rb.is_ok()].into_iter().filter(|ok| *ok).count();
    assert_eq!(successes, 1);
    let loser = if ra.is_ok() { rb } else { ra };
    assert!(matches!(loser.unwrap_err(), ResolveError::AlreadyScheduled(_)));
}

/// A job pinned to a machine that isn't in the fleet gets an offer with
/// an empty candidate list; nothing ever gets scheduled.
#[tokio::test]
async fn pinned_machine_wrong_fleet() {
    init_tracing();
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let replica = build_replica(kv, "replica-a");
    add_machine(&replica.registry, "m1").await;
    replica.cluster.write().seed_machine(Machine {
        id: "m1".to_owned(),
        metadata: Default::default(),
    });

    let mut requirements = Requirements::default();
    requirements.machine_id = Some("nope".to_owned());
    let j2 = job("j2", requirements);
    replica.registry.create_job(&j2).await.unwrap();

    let offer = replica.scheduler.offer_job(&j2).await.unwrap().unwrap();
    assert!(offer.machine_ids.is_empty());
    assert_eq!(replica.registry.get_schedule("j2").await.unwrap(), None);
}

/// J3 conflicts with J4, which is already scheduled on the only active
/// machine: J3's offer has an empty candidate set.
#[tokio::test]
async fn conflicting_jobs() {
    init_tracing();
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let replica = build_replica(kv, "replica-a");
    add_machine(&replica.registry, "m1").await;
    replica.cluster.write().seed_machine(Machine {
        id: "m1".to_owned(),
        metadata: Default::default(),
    });

    let j4 = job("j4", Requirements::default());
    replica.registry.create_job(&j4).await.unwrap();
    replica.registry.schedule("j4", "m1").await.unwrap();
    replica.cluster.write().seed_schedule("j4".to_owned(), "m1".to_owned());

    let mut requirements = Requirements::default();
    requirements.conflicts.push("j4".to_owned());
    let j3 = job("j3", requirements);
    replica.registry.create_job(&j3).await.unwrap();

    let offer = replica.scheduler.offer_job(&j3).await.unwrap().unwrap();
    assert!(offer.machine_ids.is_empty());
}

/// A replica that locks a job's mutex and dies before publishing the
/// offer blocks progress only until the TTL lapses; another replica then
/// acquires the lock and publishes the offer itself.
#[tokio::test]
async fn lock_holder_crash() {
    init_tracing();
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let registry = Registry::new(kv.clone(), "/fleet");

    let crashed = Mutex::lock(
        kv.clone(),
        &registry.lock_key("j5"),
        "replica-a",
        Duration::from_millis(20),
    )
    .await
    .unwrap()
    .unwrap();
    std::mem::forget(crashed); // simulate the holder dying without unlocking

    tokio::time::sleep(Duration::from_millis(60)).await;

    let replica_b = build_replica(kv, "replica-b");
    let j5 = job("j5", Requirements::default());
    replica_b.registry.create_job(&j5).await.unwrap();
    let offer = replica_b.scheduler.offer_job(&j5).await.unwrap();
    assert!(offer.is_some());
}

/// When a job's host machine's presence lapses, the schedule is cleared
/// and the job is re-offered; if another eligible machine exists it gets
/// scheduled there on the next bid.
#[tokio::test]
async fn machine_loss() {
    init_tracing();
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let replica = build_replica(kv, "replica-a");
    add_machine(&replica.registry, "m1").await;
    add_machine(&replica.registry, "m2").await;
    replica.cluster.write().seed_machine(Machine {
        id: "m1".to_owned(),
        metadata: Default::default(),
    });
    replica.cluster.write().seed_machine(Machine {
        id: "m2".to_owned(),
        metadata: Default::default(),
    });

    let j6 = job("j6", Requirements::default());
    replica.registry.create_job(&j6).await.unwrap();
    replica.registry.schedule("j6", "m1").await.unwrap();
    replica.cluster.write().seed_schedule("j6".to_owned(), "m1".to_owned());

    replica
        .reactor
        .dispatch(DomainEvent::MachineRemoved("m1".to_owned()))
        .await;

    assert_eq!(replica.registry.get_schedule("j6").await.unwrap(), None);
    let offer = replica.registry.get_offer("j6").await.unwrap();
    assert_eq!(offer.machine_ids, vec!["m2".to_owned()]);

    replica.registry.create_bid("j6", "m2").await.unwrap();
    let winner = replica.scheduler.attempt_resolve("j6").await.unwrap();
    assert_eq!(winner, Some("m2".to_owned()));
}

/// Reactor idempotence: replaying the full event log against a
/// freshly-initialized model (already caught up via `snapshot`) produces
/// no further KV writes for state it already reflects.
#[tokio::test]
async fn reactor_idempotence_on_replay() {
    init_tracing();
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let registry = Registry::new(kv.clone(), "/fleet");
    add_machine(&registry, "m1").await;

    let j1 = job("j1", Requirements::default());
    registry.create_job(&j1).await.unwrap();
    registry.schedule("j1", "m1").await.unwrap();

    let replica = build_replica(kv, "replica-a");
    let resumed_from = replica.reactor.snapshot().await.unwrap();

    // Replaying from 0 (as a brand-new replica reading the full log would)
    // must not disturb the already-converged schedule.
    replica
        .reactor
        .dispatch(DomainEvent::JobScheduled {
            job_name: "j1".to_owned(),
            machine_id: "m1".to_owned(),
        })
        .await;

    assert_eq!(
        replica.registry.get_schedule("j1").await.unwrap(),
        Some("m1".to_owned())
    );
    assert!(resumed_from > 0, "snapshot should observe the prior writes");
}
