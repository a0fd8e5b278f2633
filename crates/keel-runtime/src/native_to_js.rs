// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Call-forwarding bridge from native code into one JavaScript executor.
//
// The executor lives behind a mutex and is only ever touched from the
// environment's script queue.  Every forwarded call is packaged as a task and
// submitted to that queue; the caller never blocks on JavaScript.  Once the
// bridge is destroyed, tasks that were already queued are skipped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use keel_bridge::{InstanceCallback, JsExecutor, ScriptQueue};
use keel_bundle::RamBundleRegistry;
use keel_core::error::Result;
use keel_core::{EnvironmentId, JsBigString, JsContextHandle, MemoryPressureLevel};
use serde_json::Value;
use tracing::{debug, error, info};

type SharedExecutor = Arc<Mutex<Box<dyn JsExecutor>>>;

/// Decrements the in-flight count when the owning task finishes or is dropped
/// unrun.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct NativeToJsBridge {
    environment: EnvironmentId,
    executor: SharedExecutor,
    queue: Arc<dyn ScriptQueue>,
    callback: Arc<dyn InstanceCallback>,
    destroyed: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    context: Option<JsContextHandle>,
    inspectable: bool,
    description: String,
}

impl NativeToJsBridge {
    pub(crate) fn new(
        environment: EnvironmentId,
        executor: Box<dyn JsExecutor>,
        queue: Arc<dyn ScriptQueue>,
        callback: Arc<dyn InstanceCallback>,
    ) -> Self {
        let context = executor.java_script_context();
        let inspectable = executor.is_inspectable();
        let description = executor.description();
        info!(environment = %environment, executor = %description, "bridge created");
        Self {
            environment,
            executor: Arc::new(Mutex::new(executor)),
            queue,
            callback,
            destroyed: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            context,
            inspectable,
            description,
        }
    }

    /// Evaluate the application right now.  Must run on the script queue;
    /// bundle loads are already queued by the environment, and re-queueing
    /// here would let later calls overtake the load.
    pub(crate) fn load_application_on_queue(
        &self,
        bundle_registry: Option<Arc<RamBundleRegistry>>,
        startup_script: JsBigString,
        source_url: &str,
    ) {
        debug_assert!(self.queue.is_on_queue(), "bundle load off the script queue");
        run_with_executor(
            &self.executor,
            &self.destroyed,
            &self.environment,
            "loadApplication",
            |executor| executor.load_application(bundle_registry, startup_script, source_url),
        );
    }

    pub fn call_function(&self, module: String, method: String, arguments: Value) -> Result<()> {
        let callback = Arc::clone(&self.callback);
        self.submit("callFunction", move |executor| {
            let result = executor.call_function(&module, &method, &arguments);
            callback.on_batch_complete();
            result
        })
    }

    pub fn invoke_callback(&self, callback_id: u64, arguments: Value) -> Result<()> {
        let callback = Arc::clone(&self.callback);
        self.submit("invokeCallback", move |executor| {
            let result = executor.invoke_callback(callback_id, &arguments);
            callback.on_batch_complete();
            result
        })
    }

    pub fn set_global_variable(&self, name: String, json_value: JsBigString) -> Result<()> {
        self.submit("setGlobalVariable", move |executor| {
            executor.set_global_variable(&name, json_value)
        })
    }

    pub fn handle_memory_pressure(&self, level: MemoryPressureLevel) -> Result<()> {
        self.submit("handleMemoryPressure", move |executor| {
            executor.handle_memory_pressure(level);
            Ok(())
        })
    }

    pub fn java_script_context(&self) -> Option<JsContextHandle> {
        self.context
    }

    pub fn is_inspectable(&self) -> bool {
        self.inspectable
    }

    /// Whether submitted calls are still waiting for or running on the
    /// script thread.
    pub fn is_batch_active(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Stop forwarding and release the executor on the script queue.
    /// Idempotent.
    pub(crate) fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let executor = Arc::clone(&self.executor);
        let environment = self.environment.clone();
        let queued = self.queue.run_on_queue(Box::new(move || {
            executor.lock().expect("executor lock poisoned").destroy();
            debug!(environment = %environment, "executor destroyed");
        }));
        if let Err(e) = queued {
            // The queue is gone; the executor is dropped with the last handle.
            debug!(environment = %self.environment, error = %e, "executor destroy not queued");
        }
    }

    fn submit<F>(&self, label: &'static str, work: F) -> Result<()>
    where
        F: FnOnce(&mut dyn JsExecutor) -> Result<()> + Send + 'static,
    {
        let guard = InFlight::enter(&self.in_flight);
        let executor = Arc::clone(&self.executor);
        let destroyed = Arc::clone(&self.destroyed);
        let environment = self.environment.clone();
        self.queue.run_on_queue(Box::new(move || {
            let _guard = guard;
            run_with_executor(&executor, &destroyed, &environment, label, work);
        }))
    }
}

fn run_with_executor<F>(
    executor: &Mutex<Box<dyn JsExecutor>>,
    destroyed: &AtomicBool,
    environment: &EnvironmentId,
    label: &str,
    work: F,
) where
    F: FnOnce(&mut dyn JsExecutor) -> Result<()>,
{
    if destroyed.load(Ordering::Acquire) {
        debug!(environment = %environment, call = label, "bridge destroyed, call skipped");
        return;
    }
    let mut executor = executor.lock().expect("executor lock poisoned");
    if let Err(e) = work(&mut **executor) {
        error!(environment = %environment, call = label, error = %e, "JavaScript call failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_bridge::stub::{
        CountingCallback, ExecutorEvent, ExecutorJournal, ManualScriptQueue,
        RecordingExecutorFactory, StubModuleRegistry,
    };
    use keel_bridge::{ExecutorContext, JsExecutorFactory};
    use serde_json::json;

    struct Fixture {
        queue: Arc<ManualScriptQueue>,
        journal: ExecutorJournal,
        callback: Arc<CountingCallback>,
        bridge: Arc<NativeToJsBridge>,
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(ManualScriptQueue::new());
        let journal = ExecutorJournal::new();
        let callback = Arc::new(CountingCallback::new());
        let environment = EnvironmentId::named("bridge-test");
        let executor = RecordingExecutorFactory::new(journal.clone())
            .inspectable(true)
            .create_executor(ExecutorContext {
                environment: environment.clone(),
                module_registry: Arc::new(StubModuleRegistry::new()),
                callback: callback.clone(),
                queue: queue.clone(),
            })
            .expect("executor");
        let bridge = Arc::new(NativeToJsBridge::new(
            environment,
            executor,
            queue.clone(),
            callback.clone(),
        ));
        Fixture {
            queue,
            journal,
            callback,
            bridge,
        }
    }

    fn load(f: &Fixture) {
        let bridge = Arc::clone(&f.bridge);
        f.queue
            .run_on_queue(Box::new(move || {
                bridge.load_application_on_queue(None, "main()".into(), "index.js")
            }))
            .expect("submit");
        f.queue.run_pending();
    }

    #[test]
    fn calls_are_queued_not_executed_inline() {
        let f = fixture();
        load(&f);
        f.bridge
            .call_function("Mod".into(), "run".into(), json!([1]))
            .expect("submit");
        assert!(f.bridge.is_batch_active());
        assert_eq!(f.journal.events().len(), 2);

        assert_eq!(f.queue.run_pending(), 1);
        assert!(!f.bridge.is_batch_active());
        assert_eq!(
            f.journal.events().last(),
            Some(&ExecutorEvent::CallFunction {
                environment: EnvironmentId::named("bridge-test"),
                module: "Mod".into(),
                method: "run".into(),
                arguments: json!([1]),
            })
        );
        assert_eq!(f.callback.completed_batches(), 1);
    }

    #[test]
    fn executor_failures_are_contained() {
        let f = fixture();
        // No application loaded: the recording executor rejects the call.
        f.bridge
            .invoke_callback(3, json!(null))
            .expect("submission succeeds");
        f.queue.run_pending();
        f.bridge
            .set_global_variable("__DEV__".into(), "true".into())
            .expect("bridge still usable");
        f.queue.run_pending();
        assert!(matches!(
            f.journal.events().last(),
            Some(ExecutorEvent::SetGlobalVariable { name, .. }) if name == "__DEV__"
        ));
    }

    #[test]
    fn destroy_skips_queued_calls_and_destroys_executor_once() {
        let f = fixture();
        f.bridge
            .handle_memory_pressure(MemoryPressureLevel::Critical)
            .expect("submit");
        f.bridge.destroy();
        f.bridge.destroy();
        f.queue.run_pending();

        let events = f.journal.events();
        assert!(!events.iter().any(|e| matches!(e, ExecutorEvent::MemoryPressure { .. })));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, ExecutorEvent::Destroyed { .. }))
                .count(),
            1
        );
        assert!(!f.bridge.is_batch_active());
    }

    #[test]
    fn inspection_data_is_captured_up_front() {
        let f = fixture();
        assert!(f.bridge.is_inspectable());
        assert_eq!(f.bridge.java_script_context(), Some(JsContextHandle(1)));
        assert!(f.bridge.description().contains("bridge-test"));
    }

    #[test]
    fn unrun_tasks_do_not_leave_batch_active() {
        let f = fixture();
        f.queue.quit();
        assert!(f.bridge.call_function("M".into(), "m".into(), json!([])).is_err());
        assert!(!f.bridge.is_batch_active());
    }
}
