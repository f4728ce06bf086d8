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

//! Observability hooks for the scheduler core. Emission transport (an
//! HTTP scrape endpoint, a push gateway) is out of scope here — this
//! module only defines the collector interface and a Prometheus-backed
//! implementation of it, the same split the teacher draws between
//! `SchedulerMetricsCollector` and its `/metrics` route.

/// Hooks the scheduler core calls as it processes events. Implementations
/// must not block or fail the caller; a metrics backend going away should
/// never affect scheduling.
pub trait SchedulerMetricsCollector: Send + Sync {
    fn record_offer_published(&self, job_name: &str, candidate_count: usize);
    fn record_offer_resolved(&self, job_name: &str, machine_id: &str);
    fn record_resolve_conflict(&self, job_name: &str);
    fn record_lock_denied(&self, resource: &str);
    fn set_active_machines(&self, count: u64);
    fn set_pending_jobs(&self, count: u64);
}

/// Drops every observation. The default when no metrics backend is wired
/// up; keeps the scheduler core's call sites unconditional.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsCollector;

impl SchedulerMetricsCollector for NoopMetricsCollector {
    fn record_offer_published(&self, _job_name: &str, _candidate_count: usize) {}
    fn record_offer_resolved(&self, _job_name: &str, _machine_id: &str) {}
    fn record_resolve_conflict(&self, _job_name: &str) {}
    fn record_lock_denied(&self, _resource: &str) {}
    fn set_active_machines(&self, _count: u64) {}
    fn set_pending_jobs(&self, _count: u64) {}
}

#[cfg(feature = "prometheus-metrics")]
pub use prometheus_impl::PrometheusMetricsCollector;

#[cfg(feature = "prometheus-metrics")]
mod prometheus_impl {
    use super::SchedulerMetricsCollector;
    use once_cell::sync::OnceCell;
    use prometheus::{
        register_counter_vec_with_registry, register_gauge_vec_with_registry, CounterVec,
        GaugeVec, Registry,
    };
    use std::sync::Arc;

    static COLLECTOR: OnceCell<Arc<dyn SchedulerMetricsCollector>> = OnceCell::new();

    pub struct PrometheusMetricsCollector {
        offers_published: CounterVec,
        offers_resolved: CounterVec,
        resolve_conflicts: CounterVec,
        lock_denials: CounterVec,
        active_machines: GaugeVec,
        pending_jobs: GaugeVec,
    }

    impl PrometheusMetricsCollector {
        pub fn new(registry: &Registry) -> prometheus::Result<Self> {
            Ok(Self {
                offers_published: register_counter_vec_with_registry!(
                    "scheduler_offers_published_total",
                    "Count of JobOffer records published",
                    &["job"],
                    registry
                )?,
                offers_resolved: register_counter_vec_with_registry!(
                    "scheduler_offers_resolved_total",
                    "Count of offers resolved into a schedule",
                    &["job", "machine"],
                    registry
                )?,
                resolve_conflicts: register_counter_vec_with_registry!(
                    "scheduler_resolve_conflicts_total",
                    "Count of ResolveJobOffer CAS losses",
                    &["job"],
                    registry
                )?,
                lock_denials: register_counter_vec_with_registry!(
                    "scheduler_lock_denials_total",
                    "Count of mutex acquisition attempts that found another holder",
                    &["resource"],
                    registry
                )?,
                active_machines: register_gauge_vec_with_registry!(
                    "scheduler_active_machines",
                    "Machines with a live presence record",
                    &["replica"],
                    registry
                )?,
                pending_jobs: register_gauge_vec_with_registry!(
                    "scheduler_pending_jobs",
                    "Jobs with no schedule record yet",
                    &["replica"],
                    registry
                )?,
            })
        }

        /// The process-wide default collector, lazily registered against
        /// the global Prometheus registry on first use.
        pub fn current() -> prometheus::Result<Arc<dyn SchedulerMetricsCollector>> {
            COLLECTOR
                .get_or_try_init(|| {
                    let collector = Self::new(prometheus::default_registry())?;
                    Ok(Arc::new(collector) as Arc<dyn SchedulerMetricsCollector>)
                })
                .map(Arc::clone)
        }
    }

    impl SchedulerMetricsCollector for PrometheusMetricsCollector {
        fn record_offer_published(&self, job_name: &str, _candidate_count: usize) {
            self.offers_published.with_label_values(&[job_name]).inc();
        }

        fn record_offer_resolved(&self, job_name: &str, machine_id: &str) {
            self.offers_resolved
                .with_label_values(&[job_name, machine_id])
                .inc();
        }

        fn record_resolve_conflict(&self, job_name: &str) {
            self.resolve_conflicts.with_label_values(&[job_name]).inc();
        }

        fn record_lock_denied(&self, resource: &str) {
            self.lock_denials.with_label_values(&[resource]).inc();
        }

        fn set_active_machines(&self, count: u64) {
            self.active_machines.with_label_values(&["self"]).set(count as f64);
        }

        fn set_pending_jobs(&self, count: u64) {
            self.pending_jobs.with_label_values(&["self"]).set(count as f64);
        }
    }
}
