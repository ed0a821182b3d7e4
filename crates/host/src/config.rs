// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Tunables for the host kernel.
///
/// Plain values with sensible defaults; the kernel reads these at
/// construction and never consults the environment.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Upper bound for the action queue before the overflow policy kicks in.
    pub max_queue_size: usize,

    /// Per-action completion deadline. Expired actions complete with a
    /// `{"__timeout": true}` result.
    pub action_completion_timeout: Duration,

    /// Age at which un-acknowledged state updates and abandoned thunks
    /// are reaped and treated as settled.
    pub update_max_age: Duration,

    /// Cadence of the background expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            action_completion_timeout: Duration::from_secs(30),
            update_max_age: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl KernelConfig {
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_action_completion_timeout(mut self, timeout: Duration) -> Self {
        self.action_completion_timeout = timeout;
        self
    }

    pub fn with_update_max_age(mut self, max_age: Duration) -> Self {
        self.update_max_age = max_age;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}
