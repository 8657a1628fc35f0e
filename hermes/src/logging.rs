// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Logging surface.
//!
//! The engine and the native layer log through the `log` facade: the
//! installed logger is the pluggable sink for every severity, and the
//! default (no logger installed) is a no-op. Binaries typically install
//! `env_logger`.
//!
//! The native layer additionally has a dedicated channel for lines produced
//! below the facade; [`set_native_log_function`] installs a formatter for
//! it. Without one, those lines are forwarded to the facade under target
//! `"na"`.

pub use na::LogFunction as NativeLogFunction;

/// Install a formatter for native-layer log lines.
pub fn set_native_log_function(f: NativeLogFunction) {
    na::set_log_function(f);
}
