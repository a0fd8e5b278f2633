// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Stub collaborators for desktop/CI builds where no JavaScript engine is
// linked in.
//
// The recording executor performs no evaluation: it appends every call it
// receives to a shared journal so callers can inspect what reached the script
// thread, and in which order.  `ManualScriptQueue` holds tasks until the
// owner drains it, which makes cross-thread orderings reproducible.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use keel_bundle::RamBundleRegistry;
use keel_core::error::{KeelError, Result};
use keel_core::{EnvironmentId, JsBigString, JsContextHandle, MemoryPressureLevel};
use serde_json::Value;
use tracing::{debug, warn};

use crate::traits::*;

// ---------------------------------------------------------------------------
// Script queue
// ---------------------------------------------------------------------------

/// A queue whose tasks only run when `run_pending` is called.
#[derive(Default)]
pub struct ManualScriptQueue {
    tasks: Mutex<VecDeque<Task>>,
    running_on: Mutex<Option<ThreadId>>,
    closed: AtomicBool,
}

impl ManualScriptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run queued tasks on the calling thread, FIFO, including tasks that
    /// are enqueued while draining.  Returns how many ran.
    pub fn run_pending(&self) -> usize {
        *self.running_on.lock().expect("queue owner lock poisoned") = Some(thread::current().id());
        let mut ran = 0;
        loop {
            let next = self.tasks.lock().expect("queue lock poisoned").pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        *self.running_on.lock().expect("queue owner lock poisoned") = None;
        ran
    }

    /// Number of tasks waiting.
    pub fn pending(&self) -> usize {
        self.tasks.lock().expect("queue lock poisoned").len()
    }
}

impl ScriptQueue for ManualScriptQueue {
    fn run_on_queue(&self, task: Task) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KeelError::Queue("manual queue has quit".into()));
        }
        self.tasks.lock().expect("queue lock poisoned").push_back(task);
        Ok(())
    }

    fn is_on_queue(&self) -> bool {
        *self.running_on.lock().expect("queue owner lock poisoned") == Some(thread::current().id())
    }

    fn quit(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Module registry and callback
// ---------------------------------------------------------------------------

/// A fixed set of native modules and their configs.
#[derive(Debug, Clone, Default)]
pub struct StubModuleRegistry {
    modules: BTreeMap<String, Value>,
}

impl StubModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, name: impl Into<String>, config: Value) -> Self {
        self.modules.insert(name.into(), config);
        self
    }
}

impl ModuleRegistry for StubModuleRegistry {
    fn module_names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    fn module_config(&self, name: &str) -> Option<Value> {
        self.modules.get(name).cloned()
    }
}

/// Keeps the pending-call count in an atomic.
#[derive(Debug, Default)]
pub struct CountingCallback {
    pending: AtomicI64,
    batches: AtomicUsize,
}

impl CountingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_calls(&self) -> i64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn completed_batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

impl InstanceCallback for CountingCallback {
    fn increment_pending_js_calls(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_pending_js_calls(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn on_batch_complete(&self) {
        self.batches.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Recording executor
// ---------------------------------------------------------------------------

/// One call observed by a `RecordingExecutor`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    Created {
        environment: EnvironmentId,
    },
    LoadApplication {
        environment: EnvironmentId,
        source_url: String,
        indexed: bool,
        startup_script: String,
    },
    CallFunction {
        environment: EnvironmentId,
        module: String,
        method: String,
        arguments: Value,
    },
    InvokeCallback {
        environment: EnvironmentId,
        callback_id: u64,
        arguments: Value,
    },
    SetGlobalVariable {
        environment: EnvironmentId,
        name: String,
        json_value: String,
    },
    MemoryPressure {
        environment: EnvironmentId,
        level: MemoryPressureLevel,
    },
    Destroyed {
        environment: EnvironmentId,
    },
}

#[derive(Default)]
struct JournalInner {
    events: Vec<ExecutorEvent>,
    bundle_registries: Vec<Arc<RamBundleRegistry>>,
}

/// Shared, append-only log of executor events.
#[derive(Clone, Default)]
pub struct ExecutorJournal {
    inner: Arc<Mutex<JournalInner>>,
}

impl ExecutorJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutorEvent> {
        self.inner.lock().expect("journal lock poisoned").events.clone()
    }

    /// The registry handed over by the most recent indexed-bundle load.
    pub fn latest_bundle_registry(&self) -> Option<Arc<RamBundleRegistry>> {
        self.inner
            .lock()
            .expect("journal lock poisoned")
            .bundle_registries
            .last()
            .cloned()
    }

    fn record(&self, event: ExecutorEvent) {
        debug!(?event, "executor event");
        self.inner.lock().expect("journal lock poisoned").events.push(event);
    }

    fn keep_registry(&self, registry: Arc<RamBundleRegistry>) {
        self.inner
            .lock()
            .expect("journal lock poisoned")
            .bundle_registries
            .push(registry);
    }
}

/// Executor that records instead of evaluating.
///
/// Like a real engine, it refuses calls into JavaScript until an application
/// has been loaded.
pub struct RecordingExecutor {
    environment: EnvironmentId,
    journal: ExecutorJournal,
    context: JsContextHandle,
    inspectable: bool,
    loaded: bool,
}

impl RecordingExecutor {
    fn require_loaded(&self, what: &str) -> Result<()> {
        if self.loaded {
            Ok(())
        } else {
            warn!(environment = %self.environment, "{what} before any application was loaded");
            Err(KeelError::Executor(format!(
                "{what}: no application loaded in {}",
                self.environment
            )))
        }
    }
}

impl JsExecutor for RecordingExecutor {
    fn load_application(
        &mut self,
        bundle_registry: Option<Arc<RamBundleRegistry>>,
        startup_script: JsBigString,
        source_url: &str,
    ) -> Result<()> {
        let indexed = bundle_registry.is_some();
        if let Some(registry) = bundle_registry {
            self.journal.keep_registry(registry);
        }
        self.journal.record(ExecutorEvent::LoadApplication {
            environment: self.environment.clone(),
            source_url: source_url.to_owned(),
            indexed,
            startup_script: startup_script.to_string_lossy(),
        });
        self.loaded = true;
        Ok(())
    }

    fn call_function(&mut self, module: &str, method: &str, arguments: &Value) -> Result<()> {
        self.require_loaded("callFunction")?;
        self.journal.record(ExecutorEvent::CallFunction {
            environment: self.environment.clone(),
            module: module.to_owned(),
            method: method.to_owned(),
            arguments: arguments.clone(),
        });
        Ok(())
    }

    fn invoke_callback(&mut self, callback_id: u64, arguments: &Value) -> Result<()> {
        self.require_loaded("invokeCallback")?;
        self.journal.record(ExecutorEvent::InvokeCallback {
            environment: self.environment.clone(),
            callback_id,
            arguments: arguments.clone(),
        });
        Ok(())
    }

    fn set_global_variable(&mut self, name: &str, json_value: JsBigString) -> Result<()> {
        self.journal.record(ExecutorEvent::SetGlobalVariable {
            environment: self.environment.clone(),
            name: name.to_owned(),
            json_value: json_value.to_string_lossy(),
        });
        Ok(())
    }

    fn handle_memory_pressure(&mut self, level: MemoryPressureLevel) {
        self.journal.record(ExecutorEvent::MemoryPressure {
            environment: self.environment.clone(),
            level,
        });
    }

    fn java_script_context(&self) -> Option<JsContextHandle> {
        Some(self.context)
    }

    fn is_inspectable(&self) -> bool {
        self.inspectable
    }

    fn description(&self) -> String {
        format!("recording executor ({})", self.environment)
    }

    fn destroy(&mut self) {
        self.journal.record(ExecutorEvent::Destroyed {
            environment: self.environment.clone(),
        });
    }
}

/// Builds `RecordingExecutor`s that all write to one journal.
pub struct RecordingExecutorFactory {
    journal: ExecutorJournal,
    inspectable: bool,
    failure: Option<String>,
    created: AtomicUsize,
}

impl RecordingExecutorFactory {
    pub fn new(journal: ExecutorJournal) -> Self {
        Self {
            journal,
            inspectable: false,
            failure: None,
            created: AtomicUsize::new(0),
        }
    }

    pub fn inspectable(mut self, inspectable: bool) -> Self {
        self.inspectable = inspectable;
        self
    }

    /// Make every `create_executor` call fail with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// How many executors were built.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl JsExecutorFactory for RecordingExecutorFactory {
    fn create_executor(&self, context: ExecutorContext) -> Result<Box<dyn JsExecutor>> {
        if let Some(message) = &self.failure {
            return Err(KeelError::Executor(message.clone()));
        }
        let serial = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.record(ExecutorEvent::Created {
            environment: context.environment.clone(),
        });
        Ok(Box::new(RecordingExecutor {
            environment: context.environment,
            journal: self.journal.clone(),
            context: JsContextHandle(serial),
            inspectable: self.inspectable,
            loaded: false,
        }))
    }
}
