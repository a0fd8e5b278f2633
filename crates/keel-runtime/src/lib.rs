// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Keel Runtime — execution environment lifecycle and the cross-thread call
// bridge.  `Instance` is the single-environment entry point; multi-environment
// hosts drive `EnvironmentRegistry` directly.

pub mod environment;
pub mod instance;
pub mod latch;
pub mod native_to_js;
pub mod registry;

pub use environment::{ExecutionEnvironment, PreloadCompletion};
pub use instance::{Instance, Readiness};
pub use latch::Latch;
pub use native_to_js::NativeToJsBridge;
pub use registry::{Collaborators, EnvironmentRef, EnvironmentRegistry, QueueFactory};
