// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Collaborator trait definitions.
//
// Everything outside the environment lifecycle (the engine, the script thread,
// native module metadata, pending-call accounting) is consumed through these
// narrow interfaces.

use std::sync::Arc;

use keel_bundle::RamBundleRegistry;
use keel_core::error::Result;
use keel_core::{EnvironmentId, JsBigString, JsContextHandle, MemoryPressureLevel};
use serde_json::Value;

/// Unit of work submitted to a script queue.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A single-thread-affine FIFO task queue.
///
/// Tasks submitted to one queue run one at a time, in submission order, on
/// the same thread.  The runtime relies on this to order a preload before any
/// bundle load or call submitted after it.
pub trait ScriptQueue: Send + Sync {
    /// Enqueue `task`.  Never blocks on the task itself.
    fn run_on_queue(&self, task: Task) -> Result<()>;

    /// Whether the calling thread is this queue's thread.
    fn is_on_queue(&self) -> bool;

    /// Stop accepting tasks.  Tasks already queued may or may not run.
    fn quit(&self);
}

/// Native module metadata, passed through to the executor unchanged.
pub trait ModuleRegistry: Send + Sync {
    fn module_names(&self) -> Vec<String>;

    /// The configuration blob JavaScript receives for `name`.
    fn module_config(&self, name: &str) -> Option<Value>;
}

/// Notified by the runtime whenever native code submits work into JavaScript.
///
/// The pending-call counter lives with the implementor; the runtime only
/// increments it.
pub trait InstanceCallback: Send + Sync {
    fn increment_pending_js_calls(&self);

    fn decrement_pending_js_calls(&self) {}

    fn on_batch_complete(&self) {}
}

/// What an executor factory gets to build an executor for one environment.
#[derive(Clone)]
pub struct ExecutorContext {
    pub environment: EnvironmentId,
    pub module_registry: Arc<dyn ModuleRegistry>,
    pub callback: Arc<dyn InstanceCallback>,
    pub queue: Arc<dyn ScriptQueue>,
}

/// One JavaScript engine instance.
///
/// Every method is called on the environment's script queue thread.
pub trait JsExecutor: Send {
    /// Evaluate the application's startup script.  `bundle_registry` is set
    /// for indexed bundles; the engine pulls modules from it on first
    /// `require`.
    fn load_application(
        &mut self,
        bundle_registry: Option<Arc<RamBundleRegistry>>,
        startup_script: JsBigString,
        source_url: &str,
    ) -> Result<()>;

    fn call_function(&mut self, module: &str, method: &str, arguments: &Value) -> Result<()>;

    fn invoke_callback(&mut self, callback_id: u64, arguments: &Value) -> Result<()>;

    /// Define `name` on the global object from a JSON document.
    fn set_global_variable(&mut self, name: &str, json_value: JsBigString) -> Result<()>;

    fn handle_memory_pressure(&mut self, _level: MemoryPressureLevel) {}

    fn java_script_context(&self) -> Option<JsContextHandle> {
        None
    }

    fn is_inspectable(&self) -> bool {
        false
    }

    /// Short engine description for logs, e.g. `"QuickJS 2024-01-13"`.
    fn description(&self) -> String;

    /// Release engine resources.  Called once, on the script thread.
    fn destroy(&mut self) {}
}

/// Builds executors.  Called on the script thread of the environment being
/// preloaded.
pub trait JsExecutorFactory: Send + Sync {
    fn create_executor(&self, context: ExecutorContext) -> Result<Box<dyn JsExecutor>>;
}
