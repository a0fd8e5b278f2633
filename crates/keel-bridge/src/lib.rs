// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Keel — Collaborator abstractions for the JavaScript bridge.
//!
//! The runtime never talks to a JavaScript engine, a thread, or the native
//! module system directly.  It goes through the traits defined here, so an
//! embedder can plug in any engine (QuickJS, V8, Hermes, ...) and any
//! threading model.  `thread_queue` provides the default script thread;
//! `stub` provides recording collaborators for desktop/CI builds and tests.

pub mod stub;
pub mod thread_queue;
pub mod traits;

use std::sync::Arc;

use keel_core::error::Result;
use keel_core::{BridgeConfig, EnvironmentId};

pub use thread_queue::ThreadScriptQueue;
pub use traits::*;

/// Spawns the default script queue for an environment: one dedicated thread
/// named after the configured prefix and the environment id.
pub fn default_script_queue(
    config: &BridgeConfig,
    environment: &EnvironmentId,
) -> Result<Arc<dyn ScriptQueue>> {
    let name = format!("{}-{}", config.script_thread_name, environment);
    let queue = ThreadScriptQueue::spawn(name, config.script_thread_stack_size)?;
    Ok(Arc::new(queue))
}
