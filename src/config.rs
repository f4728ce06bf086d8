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
//

//! Scheduler tunables. Loading these from a file or CLI is an external
//! collaborator's job; this struct is just the in-memory configuration
//! surface the scheduler components are constructed with.

use std::time::Duration;

/// Configuration for a single scheduler replica.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// TTL granted to a resource mutex on acquisition.
    pub lock_ttl: Duration,
    /// Mutexes held across a long operation are renewed after this
    /// fraction of `lock_ttl` has elapsed. The spec calls for TTL/3.
    pub lock_renew_fraction: u32,
    /// TTL granted to advisory `JobState` records.
    pub job_state_ttl: Duration,
    /// Bounded capacity of the event reactor's inbound queue.
    pub event_queue_capacity: usize,
    /// Lower bound of the jittered backoff used when a watch disconnects.
    pub watch_backoff_min: Duration,
    /// Upper bound of the jittered backoff used when a watch disconnects.
    pub watch_backoff_max: Duration,
    /// Attempts per step of `RemoveJob`'s bids -> offer -> schedule -> job
    /// sequence before giving up on a transport error.
    pub remove_job_max_attempts: u32,
    /// Base of the jittered backoff between `RemoveJob` step retries.
    pub remove_job_retry_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10),
            lock_renew_fraction: 3,
            job_state_ttl: Duration::from_secs(30),
            event_queue_capacity: 10_000,
            watch_backoff_min: Duration::from_millis(200),
            watch_backoff_max: Duration::from_secs(5),
            remove_job_max_attempts: 3,
            remove_job_retry_backoff: Duration::from_millis(100),
        }
    }
}

impl SchedulerConfig {
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_lock_renew_fraction(mut self, fraction: u32) -> Self {
        self.lock_renew_fraction = fraction;
        self
    }

    pub fn with_job_state_ttl(mut self, ttl: Duration) -> Self {
        self.job_state_ttl = ttl;
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    pub fn with_remove_job_max_attempts(mut self, attempts: u32) -> Self {
        self.remove_job_max_attempts = attempts;
        self
    }

    /// The interval at which a held mutex should be renewed, derived from
    /// `lock_ttl` and `lock_renew_fraction`.
    pub fn lock_renew_interval(&self) -> Duration {
        self.lock_ttl / self.lock_renew_fraction.max(1)
    }
}
