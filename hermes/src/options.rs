// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

/// Construction options for [`crate::AsyncEngine`].
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Ask the native layer to accelerate same-node traffic over shared
    /// memory.
    pub use_auto_sm: bool,

    /// Log usage statistics when the engine is torn down.
    pub print_stats: bool,

    /// Never block inside native progress.
    pub force_no_block_progress: bool,

    /// The process may fork after engine creation; a child must not
    /// finalize the native layer the parent still uses.
    pub process_may_fork: bool,

    /// Per-attempt bound on waiting for a posted request's response.
    pub rpc_timeout: Duration,

    /// How many times a timed-out request is resubmitted before its future
    /// resolves to a timeout error.
    pub rpc_retries: u8,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            use_auto_sm: false,
            print_stats: false,
            force_no_block_progress: false,
            process_may_fork: false,
            rpc_timeout: Duration::from_secs(100),
            rpc_retries: 0,
        }
    }
}
