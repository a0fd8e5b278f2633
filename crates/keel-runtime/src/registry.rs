// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Environment registry.
//
// Owns every execution environment, keyed by id.  Outside holders only ever
// get an `EnvironmentRef` (a weak handle resolved per call), so disposing the
// registry never leaves anyone holding a live environment.
//
// Lock order: registry map, then environment state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use keel_bridge::{InstanceCallback, JsExecutorFactory, ModuleRegistry, ScriptQueue};
use keel_bundle::Bundle;
use keel_core::error::{KeelError, Result};
use keel_core::{EnvironmentId, EnvironmentSnapshot};
use tracing::{debug, info, instrument};

use crate::environment::{ExecutionEnvironment, PreloadCompletion};

/// Produces the script queue an environment runs on.
pub type QueueFactory =
    Arc<dyn Fn(&EnvironmentId) -> Result<Arc<dyn ScriptQueue>> + Send + Sync>;

/// The external collaborators every environment is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub executor_factory: Arc<dyn JsExecutorFactory>,
    pub module_registry: Arc<dyn ModuleRegistry>,
    pub callback: Arc<dyn InstanceCallback>,
}

/// Non-owning handle to an environment.
///
/// Resolve it at each use; never keep the resolved `Arc` across a
/// suspension point.
#[derive(Clone)]
pub struct EnvironmentRef {
    id: EnvironmentId,
    environment: Weak<ExecutionEnvironment>,
}

impl EnvironmentRef {
    pub fn id(&self) -> &EnvironmentId {
        &self.id
    }

    /// The environment, unless it is gone or disposed.
    pub fn resolve(&self) -> Result<Arc<ExecutionEnvironment>> {
        self.environment
            .upgrade()
            .filter(|env| !env.is_disposed())
            .ok_or_else(|| KeelError::NotReadyOrDisposed {
                environment: self.id.clone(),
            })
    }

    pub fn is_resolvable(&self) -> bool {
        self.resolve().is_ok()
    }
}

pub struct EnvironmentRegistry {
    collaborators: Collaborators,
    queue_factory: QueueFactory,
    environments: Mutex<HashMap<EnvironmentId, Arc<ExecutionEnvironment>>>,
}

impl EnvironmentRegistry {
    pub fn new(collaborators: Collaborators, queue_factory: QueueFactory) -> Self {
        Self {
            collaborators,
            queue_factory,
            environments: Mutex::new(HashMap::new()),
        }
    }

    /// Every environment runs on `queue`.
    pub fn with_shared_queue(collaborators: Collaborators, queue: Arc<dyn ScriptQueue>) -> Self {
        Self::new(
            collaborators,
            Arc::new(move |_: &EnvironmentId| -> Result<Arc<dyn ScriptQueue>> {
                Ok(Arc::clone(&queue))
            }),
        )
    }

    /// Create the environment for `id` if needed and preload it.
    ///
    /// A repeat call for the same id joins the preload in flight, or runs
    /// `completion` immediately when the preload already finished.
    #[instrument(skip(self, completion), fields(environment = %id))]
    pub fn preload_environment<F>(&self, id: &EnvironmentId, completion: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let completion: PreloadCompletion = Box::new(completion);
        let mut environments = self.lock_environments();
        if let Some(existing) = environments.get(id) {
            let existing = Arc::clone(existing);
            drop(environments);
            debug!("joining existing environment");
            return existing.join_preload(completion);
        }

        let queue = (self.queue_factory)(id)?;
        let env = Arc::new(ExecutionEnvironment::new(
            id.clone(),
            queue,
            self.collaborators.clone(),
        ));
        env.preload(completion)?;
        environments.insert(id.clone(), env);
        info!("environment registered");
        Ok(())
    }

    /// Load `bundle` into an existing environment.  Never creates one.
    #[instrument(skip(self, bundle), fields(environment = %id, source_url = bundle.source_url()))]
    pub fn run_in_environment(&self, id: &EnvironmentId, bundle: Box<dyn Bundle>) -> Result<()> {
        let env = self
            .lock_environments()
            .get(id)
            .cloned()
            .ok_or_else(|| KeelError::NoSuchEnvironment {
                environment: id.clone(),
            })?;
        env.load_bundle(bundle)
    }

    /// A weak handle; resolves to nothing for unknown or disposed ids.
    pub fn get_environment(&self, id: &EnvironmentId) -> EnvironmentRef {
        let environment = self
            .lock_environments()
            .get(id)
            .map(Arc::downgrade)
            .unwrap_or_default();
        EnvironmentRef {
            id: id.clone(),
            environment,
        }
    }

    /// Whether `id` is registered, preloaded or not.
    pub fn has_environment(&self, id: &EnvironmentId) -> bool {
        self.lock_environments().contains_key(id)
    }

    pub fn environment_ids(&self) -> Vec<EnvironmentId> {
        let mut ids: Vec<_> = self.lock_environments().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self, id: &EnvironmentId) -> Option<EnvironmentSnapshot> {
        self.lock_environments().get(id).map(|env| env.snapshot())
    }

    /// Dispose every environment, then forget them.  Safe with preloads in
    /// flight; those discard their result when they run.
    pub fn dispose_environments(&self) {
        let mut environments = self.lock_environments();
        if environments.is_empty() {
            return;
        }
        for env in environments.values() {
            env.dispose();
        }
        let disposed: Vec<_> = environments.drain().map(|(_, env)| env).collect();
        drop(environments);
        info!(count = disposed.len(), "environments disposed");
    }

    fn lock_environments(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<EnvironmentId, Arc<ExecutionEnvironment>>> {
        self.environments
            .lock()
            .expect("environment registry lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_bridge::stub::{
        CountingCallback, ExecutorEvent, ExecutorJournal, ManualScriptQueue,
        RecordingExecutorFactory, StubModuleRegistry,
    };
    use keel_bridge::{ExecutorContext, JsExecutor};
    use keel_bundle::{StringBundle, write_indexed_bundle};
    use serde_json::json;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        queue: Arc<ManualScriptQueue>,
        journal: ExecutorJournal,
        factory: Arc<RecordingExecutorFactory>,
        callback: Arc<CountingCallback>,
        registry: EnvironmentRegistry,
    }

    fn fixture_with(factory: RecordingExecutorFactory, journal: ExecutorJournal) -> Fixture {
        let queue = Arc::new(ManualScriptQueue::new());
        let factory = Arc::new(factory);
        let callback = Arc::new(CountingCallback::new());
        let registry = EnvironmentRegistry::with_shared_queue(
            Collaborators {
                executor_factory: factory.clone(),
                module_registry: Arc::new(StubModuleRegistry::new()),
                callback: callback.clone(),
            },
            queue.clone(),
        );
        Fixture {
            queue,
            journal,
            factory,
            callback,
            registry,
        }
    }

    fn fixture() -> Fixture {
        let journal = ExecutorJournal::new();
        fixture_with(RecordingExecutorFactory::new(journal.clone()), journal)
    }

    /// Records every completion result it receives.
    #[derive(Clone, Default)]
    struct Completions(Arc<Mutex<Vec<std::result::Result<(), String>>>>);

    impl Completions {
        fn callback(&self) -> impl FnOnce(Result<()>) + Send + 'static {
            let seen = Arc::clone(&self.0);
            move |result| seen.lock().unwrap().push(result.map_err(|e| e.to_string()))
        }

        fn results(&self) -> Vec<std::result::Result<(), String>> {
            self.0.lock().unwrap().clone()
        }
    }

    fn id(name: &str) -> EnvironmentId {
        EnvironmentId::named(name)
    }

    #[test]
    fn unknown_environment_is_absent() {
        let f = fixture();
        assert!(!f.registry.has_environment(&id("nope")));
        assert!(!f.registry.get_environment(&id("nope")).is_resolvable());
        let err = f
            .registry
            .run_in_environment(&id("nope"), Box::new(StringBundle::new("a.js", "1")))
            .unwrap_err();
        assert!(matches!(err, KeelError::NoSuchEnvironment { environment } if environment == id("nope")));
        // run_in_environment never creates.
        assert!(!f.registry.has_environment(&id("nope")));
    }

    #[test]
    fn preload_registers_immediately_and_completes_on_queue() {
        let f = fixture();
        let done = Completions::default();
        f.registry
            .preload_environment(&id("main"), done.callback())
            .expect("preload");

        assert!(f.registry.has_environment(&id("main")));
        assert!(done.results().is_empty());
        let env = f.registry.get_environment(&id("main")).resolve().expect("resolve");
        assert!(!env.is_ready());

        f.queue.run_pending();
        assert_eq!(done.results(), vec![Ok(())]);
        assert!(env.is_ready());
        assert_eq!(f.factory.created(), 1);
    }

    #[test]
    fn repeat_preload_joins_in_flight_preload() {
        let f = fixture();
        let done = Completions::default();
        f.registry
            .preload_environment(&id("main"), done.callback())
            .expect("first");
        f.registry
            .preload_environment(&id("main"), done.callback())
            .expect("second");
        f.queue.run_pending();

        assert_eq!(done.results(), vec![Ok(()), Ok(())]);
        assert_eq!(f.factory.created(), 1);
    }

    #[test]
    fn repeat_preload_after_completion_runs_immediately() {
        let f = fixture();
        f.registry
            .preload_environment(&id("main"), |_| {})
            .expect("first");
        f.queue.run_pending();

        let done = Completions::default();
        f.registry
            .preload_environment(&id("main"), done.callback())
            .expect("second");
        assert_eq!(done.results(), vec![Ok(())]);
        assert_eq!(f.queue.pending(), 0);
    }

    #[test]
    fn load_is_ordered_behind_preload() {
        let f = fixture();
        f.registry
            .preload_environment(&id("main"), |_| {})
            .expect("preload");
        f.registry
            .run_in_environment(
                &id("main"),
                Box::new(StringBundle::new("index.js", "AppRegistry.run()")),
            )
            .expect("load");
        f.queue.run_pending();

        let events = f.journal.events();
        assert!(matches!(events[0], ExecutorEvent::Created { .. }));
        assert_eq!(
            events[1],
            ExecutorEvent::LoadApplication {
                environment: id("main"),
                source_url: "index.js".into(),
                indexed: false,
                startup_script: "AppRegistry.run()".into(),
            }
        );
    }

    #[test]
    fn indexed_bundle_installs_lazy_module_registry() {
        let f = fixture();
        f.registry
            .preload_environment(&id("main"), |_| {})
            .expect("preload");
        let bytes = write_indexed_bundle("__r(0);", &[Some("__d(0)"), Some("__d(1)")]);
        f.registry
            .run_in_environment(&id("main"), Box::new(StringBundle::new("main.bundle", bytes)))
            .expect("load");
        f.queue.run_pending();

        assert!(matches!(
            f.journal.events().last(),
            Some(ExecutorEvent::LoadApplication { indexed: true, startup_script, .. })
                if startup_script == "__r(0);"
        ));
        let modules = f.journal.latest_bundle_registry().expect("registry handed over");
        assert_eq!(modules.module(0, 1).expect("module").code, "__d(1)");
    }

    #[test]
    fn corrupt_indexed_bundle_is_reported_to_caller() {
        let f = fixture();
        f.registry
            .preload_environment(&id("main"), |_| {})
            .expect("preload");
        let mut bytes = write_indexed_bundle("x", &[]);
        bytes[8..12].copy_from_slice(&999u32.to_le_bytes());
        let err = f
            .registry
            .run_in_environment(&id("main"), Box::new(StringBundle::new("bad.bundle", bytes)))
            .unwrap_err();
        assert!(matches!(err, KeelError::InvalidBundle(_)));
    }

    #[test]
    fn forwarding_counts_pending_calls() {
        let f = fixture();
        f.registry
            .preload_environment(&id("main"), |_| {})
            .expect("preload");
        f.queue.run_pending();
        let env = f.registry.get_environment(&id("main")).resolve().expect("resolve");

        env.call_function("M", "m", json!([])).expect("call");
        env.invoke_callback(9, json!({"ok": true})).expect("callback");
        env.set_global_variable("x", "42".into()).expect("global");
        assert_eq!(env.pending_calls(), 2);
        assert_eq!(f.callback.pending_calls(), 2);
        assert_eq!(f.registry.snapshot(&id("main")).expect("snapshot").pending_calls, 2);
    }

    #[test]
    fn dispose_with_preload_in_flight_discards_result() {
        let f = fixture();
        let done = Completions::default();
        f.registry
            .preload_environment(&id("main"), done.callback())
            .expect("preload");
        let handle = f.registry.get_environment(&id("main"));
        let held = handle.resolve().expect("resolve before dispose");

        f.registry.dispose_environments();
        assert!(!f.registry.has_environment(&id("main")));
        assert!(!handle.is_resolvable());

        f.queue.run_pending();
        assert_eq!(done.results().len(), 1);
        assert!(done.results()[0].is_err());
        assert_eq!(f.factory.created(), 0);
        assert!(!held.is_ready());
        assert!(matches!(
            held.set_global_variable("x", "42".into()),
            Err(KeelError::NotReadyOrDisposed { .. })
        ));
    }

    /// Disposes the registry from inside executor construction, i.e. after
    /// the preload checked the flag but before it installs the bridge.
    struct DisposingFactory {
        inner: RecordingExecutorFactory,
        registry: OnceLock<Weak<EnvironmentRegistry>>,
        calls: AtomicUsize,
    }

    impl JsExecutorFactory for DisposingFactory {
        fn create_executor(&self, context: ExecutorContext) -> Result<Box<dyn JsExecutor>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
                registry.dispose_environments();
            }
            self.inner.create_executor(context)
        }
    }

    #[test]
    fn dispose_racing_executor_construction_discards_bridge() {
        let journal = ExecutorJournal::new();
        let queue = Arc::new(ManualScriptQueue::new());
        let factory = Arc::new(DisposingFactory {
            inner: RecordingExecutorFactory::new(journal.clone()),
            registry: OnceLock::new(),
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(EnvironmentRegistry::with_shared_queue(
            Collaborators {
                executor_factory: factory.clone(),
                module_registry: Arc::new(StubModuleRegistry::new()),
                callback: Arc::new(CountingCallback::new()),
            },
            queue.clone(),
        ));
        let _ = factory.registry.set(Arc::downgrade(&registry));

        let done = Completions::default();
        registry
            .preload_environment(&id("main"), done.callback())
            .expect("preload");
        let held = registry.get_environment(&id("main")).resolve().expect("resolve");
        queue.run_pending();

        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
        assert!(done.results()[0].is_err());
        assert!(!held.is_ready());
        // The discarded executor is still released.
        assert!(journal
            .events()
            .iter()
            .any(|e| matches!(e, ExecutorEvent::Destroyed { .. })));
    }

    #[test]
    fn dispose_is_idempotent() {
        let f = fixture();
        f.registry.dispose_environments();
        f.registry
            .preload_environment(&id("a"), |_| {})
            .expect("preload");
        f.queue.run_pending();
        let env = f.registry.get_environment(&id("a")).resolve().expect("resolve");
        f.registry.dispose_environments();
        f.registry.dispose_environments();
        env.dispose();
        assert!(env.is_disposed());
        assert!(f.registry.environment_ids().is_empty());
    }

    #[test]
    fn disposed_environment_destroys_its_executor() {
        let f = fixture();
        f.registry
            .preload_environment(&id("a"), |_| {})
            .expect("preload");
        f.queue.run_pending();
        f.registry.dispose_environments();
        f.queue.run_pending();
        assert!(matches!(
            f.journal.events().last(),
            Some(ExecutorEvent::Destroyed { environment }) if *environment == id("a")
        ));
    }

    #[test]
    fn failed_executor_construction_reaches_completion() {
        let journal = ExecutorJournal::new();
        let f = fixture_with(
            RecordingExecutorFactory::new(journal.clone()).failing("engine missing"),
            journal,
        );
        let done = Completions::default();
        f.registry
            .preload_environment(&id("main"), done.callback())
            .expect("preload queued");
        f.queue.run_pending();

        assert_eq!(
            done.results(),
            vec![Err("executor error: engine missing".to_string())]
        );
        let env = f.registry.get_environment(&id("main")).resolve().expect("still registered");
        assert!(matches!(
            env.call_function("M", "m", json!([])),
            Err(KeelError::NotReadyOrDisposed { .. })
        ));
        assert!(matches!(
            f.registry
                .run_in_environment(&id("main"), Box::new(StringBundle::new("a.js", "1"))),
            Err(KeelError::NotReadyOrDisposed { .. })
        ));
    }

    #[test]
    fn queue_factory_is_called_once_per_environment() {
        let journal = ExecutorJournal::new();
        let queues: Arc<Mutex<Vec<(EnvironmentId, Arc<ManualScriptQueue>)>>> = Arc::default();
        let made = Arc::clone(&queues);
        let registry = EnvironmentRegistry::new(
            Collaborators {
                executor_factory: Arc::new(RecordingExecutorFactory::new(journal.clone())),
                module_registry: Arc::new(StubModuleRegistry::new()),
                callback: Arc::new(CountingCallback::new()),
            },
            Arc::new(move |env_id: &EnvironmentId| -> Result<Arc<dyn ScriptQueue>> {
                let queue = Arc::new(ManualScriptQueue::new());
                made.lock().unwrap().push((env_id.clone(), Arc::clone(&queue)));
                Ok(queue)
            }),
        );

        registry.preload_environment(&id("a"), |_| {}).expect("a");
        registry.preload_environment(&id("b"), |_| {}).expect("b");
        registry.preload_environment(&id("a"), |_| {}).expect("a again");

        let queues = queues.lock().unwrap().clone();
        assert_eq!(queues.len(), 2);
        // Only b's queue is drained: a stays unready.
        queues[1].1.run_pending();
        assert!(!registry.get_environment(&id("a")).resolve().expect("a").is_ready());
        assert!(registry.get_environment(&id("b")).resolve().expect("b").is_ready());
        assert_eq!(registry.environment_ids(), vec![id("a"), id("b")]);
    }
}
