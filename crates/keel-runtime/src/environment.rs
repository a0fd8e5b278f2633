// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Execution environment: one JavaScript runtime plus its call-forwarding
// bridge.
//
// Lifecycle: created empty by the registry, preloaded asynchronously on its
// script queue (which builds the executor and installs the bridge), disposed
// once.  The bridge slot and the disposed flag share one lock, so a preload
// that finishes after disposal sees the flag and throws its work away instead
// of installing a bridge nobody can reach.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use keel_bridge::{ExecutorContext, ScriptQueue};
use keel_bundle::{Bundle, IndexedBundle, RamBundleRegistry, fingerprint};
use keel_core::error::{KeelError, Result};
use keel_core::{
    EnvironmentId, EnvironmentSnapshot, JsBigString, JsContextHandle, MemoryPressureLevel,
    ScriptTag,
};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::native_to_js::NativeToJsBridge;
use crate::registry::Collaborators;

/// Report a programmer error: fatal in debug builds, `KeelError::Usage` in
/// release builds.  Never call with a lock held.
pub(crate) fn usage_violation(message: String) -> KeelError {
    error!("{message}");
    if cfg!(debug_assertions) {
        panic!("usage error: {message}");
    }
    KeelError::Usage(message)
}

/// Invoked once when a preload finishes, fails, or is discarded by disposal.
pub type PreloadCompletion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

#[derive(Debug, Clone)]
enum PreloadOutcome {
    Ready,
    Failed(String),
    Discarded,
}

impl PreloadOutcome {
    fn to_result(&self, environment: &EnvironmentId) -> Result<()> {
        match self {
            Self::Ready => Ok(()),
            Self::Failed(message) => Err(KeelError::Executor(message.clone())),
            Self::Discarded => Err(KeelError::NotReadyOrDisposed {
                environment: environment.clone(),
            }),
        }
    }
}

enum Preload {
    NotStarted,
    InFlight(Vec<PreloadCompletion>),
    Complete(PreloadOutcome),
}

struct EnvState {
    preload: Preload,
    bridge: Option<Arc<NativeToJsBridge>>,
    bundle_registry: Option<Arc<RamBundleRegistry>>,
    disposed: bool,
    ready_at: Option<DateTime<Utc>>,
}

pub struct ExecutionEnvironment {
    id: EnvironmentId,
    queue: Arc<dyn ScriptQueue>,
    collaborators: Collaborators,
    state: Mutex<EnvState>,
    pending_calls: AtomicU64,
    created_at: DateTime<Utc>,
}

impl ExecutionEnvironment {
    pub(crate) fn new(
        id: EnvironmentId,
        queue: Arc<dyn ScriptQueue>,
        collaborators: Collaborators,
    ) -> Self {
        debug!(environment = %id, "execution environment created");
        Self {
            id,
            queue,
            collaborators,
            state: Mutex::new(EnvState {
                preload: Preload::NotStarted,
                bridge: None,
                bundle_registry: None,
                disposed: false,
                ready_at: None,
            }),
            pending_calls: AtomicU64::new(0),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &EnvironmentId {
        &self.id
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Build the executor and bridge on the script queue, then call
    /// `completion`.
    ///
    /// `completion` runs exactly once if this returns `Ok`; on `Err` it is
    /// dropped uncalled.  A second call is a usage error (a panic in debug
    /// builds).
    #[instrument(skip_all, fields(environment = %self.id))]
    pub fn preload(self: &Arc<Self>, completion: PreloadCompletion) -> Result<()> {
        let mut state = self.lock_state();
        if state.disposed {
            return Err(self.not_ready());
        }
        if !matches!(state.preload, Preload::NotStarted) {
            drop(state);
            return Err(usage_violation(format!(
                "environment {} is already preloading or preloaded",
                self.id
            )));
        }
        state.preload = Preload::InFlight(vec![completion]);
        drop(state);

        let env = Arc::clone(self);
        let submitted = self
            .queue
            .run_on_queue(Box::new(move || env.finish_preload()));
        if let Err(e) = submitted {
            warn!(error = %e, "preload could not be queued");
            self.lock_state().preload =
                Preload::Complete(PreloadOutcome::Failed(format!("preload not queued: {e}")));
            return Err(e);
        }
        debug!("preload queued");
        Ok(())
    }

    /// Attach `completion` to a preload that was already started.
    ///
    /// Runs `completion` immediately (on the calling thread) when the
    /// preload has finished.
    pub(crate) fn join_preload(&self, completion: PreloadCompletion) -> Result<()> {
        let mut state = self.lock_state();
        if state.disposed {
            return Err(self.not_ready());
        }
        let result = match &mut state.preload {
            Preload::NotStarted => {
                return Err(KeelError::Usage(format!(
                    "environment {} was never preloaded",
                    self.id
                )));
            }
            Preload::InFlight(waiters) => {
                waiters.push(completion);
                return Ok(());
            }
            Preload::Complete(outcome) => outcome.to_result(&self.id),
        };
        drop(state);
        completion(result);
        Ok(())
    }

    /// Runs on the script queue.
    fn finish_preload(self: Arc<Self>) {
        let outcome = if self.is_disposed() {
            PreloadOutcome::Discarded
        } else {
            let context = ExecutorContext {
                environment: self.id.clone(),
                module_registry: Arc::clone(&self.collaborators.module_registry),
                callback: Arc::clone(&self.collaborators.callback),
                queue: Arc::clone(&self.queue),
            };
            match self.collaborators.executor_factory.create_executor(context) {
                Ok(executor) => self.install(NativeToJsBridge::new(
                    self.id.clone(),
                    executor,
                    Arc::clone(&self.queue),
                    Arc::clone(&self.collaborators.callback),
                )),
                Err(e) => {
                    error!(environment = %self.id, error = %e, "executor construction failed");
                    match e {
                        KeelError::Executor(message) => PreloadOutcome::Failed(message),
                        other => PreloadOutcome::Failed(other.to_string()),
                    }
                }
            }
        };

        let waiters = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut state.preload, Preload::Complete(outcome.clone())) {
                Preload::InFlight(waiters) => waiters,
                _ => Vec::new(),
            }
        };
        for waiter in waiters {
            waiter(outcome.to_result(&self.id));
        }
    }

    fn install(&self, bridge: NativeToJsBridge) -> PreloadOutcome {
        let mut state = self.lock_state();
        if state.disposed {
            drop(state);
            debug!(environment = %self.id, "disposed during preload, discarding bridge");
            bridge.destroy();
            return PreloadOutcome::Discarded;
        }
        state.bridge = Some(Arc::new(bridge));
        state.ready_at = Some(Utc::now());
        info!(environment = %self.id, "environment ready");
        PreloadOutcome::Ready
    }

    /// Release the bridge and mark the environment unusable.  Idempotent.
    pub fn dispose(&self) {
        let bridge = {
            let mut state = self.lock_state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.bundle_registry = None;
            state.bridge.take()
        };
        if let Some(bridge) = bridge {
            bridge.destroy();
        }
        info!(environment = %self.id, "environment disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.lock_state().disposed
    }

    /// Whether the bridge is installed.
    pub fn is_ready(&self) -> bool {
        self.lock_state().bridge.is_some()
    }

    // -- Bundles -------------------------------------------------------------

    /// Sniff `bundle` and queue it for loading behind the preload.
    ///
    /// Indexed bundles get a segment registry so modules load on first
    /// `require`; plain scripts are evaluated whole.  Reading and parsing
    /// happen here, so their errors reach the caller.  Loading before
    /// `preload` is a usage error (a panic in debug builds).
    ///
    /// A load accepted while the preload is still in flight is dropped if
    /// that preload then fails or is discarded.  The caller has already seen
    /// `Ok`; the failure is reported through the preload completion instead.
    #[instrument(skip_all, fields(environment = %self.id, source_url = bundle.source_url()))]
    pub fn load_bundle(self: &Arc<Self>, bundle: Box<dyn Bundle>) -> Result<()> {
        let preloaded = {
            let state = self.lock_state();
            if state.disposed {
                return Err(self.not_ready());
            }
            match &state.preload {
                Preload::NotStarted => false,
                Preload::Complete(PreloadOutcome::Failed(_) | PreloadOutcome::Discarded) => {
                    return Err(self.not_ready());
                }
                Preload::InFlight(_) | Preload::Complete(PreloadOutcome::Ready) => true,
            }
        };
        if !preloaded {
            return Err(usage_violation(format!(
                "load_bundle on environment {} before preload",
                self.id
            )));
        }

        let source_url = bundle.source_url().to_owned();
        let tag = bundle.script_tag();
        let script = bundle.script()?;
        info!(
            tag = ?tag,
            bytes = script.len(),
            fingerprint = %fingerprint(&script),
            "loading bundle"
        );

        let (bundle_registry, startup_script) = match tag {
            ScriptTag::IndexedBundle => {
                let indexed = IndexedBundle::parse(script)?;
                let startup = indexed.startup_code();
                let registry = Arc::new(RamBundleRegistry::new(indexed));
                (Some(registry), startup)
            }
            ScriptTag::PlainScript => (None, script),
        };

        {
            let mut state = self.lock_state();
            if state.disposed {
                return Err(self.not_ready());
            }
            if let Some(registry) = &bundle_registry {
                state.bundle_registry = Some(Arc::clone(registry));
            }
        }

        let env = Arc::clone(self);
        self.queue.run_on_queue(Box::new(move || {
            match env.bridge() {
                Ok(bridge) => {
                    bridge.load_application_on_queue(bundle_registry, startup_script, &source_url)
                }
                Err(_) => {
                    error!(environment = %env.id, source_url = %source_url, "preload did not complete, bundle dropped")
                }
            }
        }))
    }

    /// Make another indexed bundle segment available to `require`.
    pub fn register_bundle(&self, segment_id: u32, path: impl Into<PathBuf>) -> Result<()> {
        let registry = {
            let state = self.lock_state();
            if state.disposed {
                return Err(self.not_ready());
            }
            state.bundle_registry.clone().ok_or_else(|| {
                KeelError::Usage(format!(
                    "environment {} has no indexed bundle to extend",
                    self.id
                ))
            })?
        };
        registry.register_segment(segment_id, path)
    }

    // -- Forwarding ----------------------------------------------------------

    pub fn call_function(
        &self,
        module: impl Into<String>,
        method: impl Into<String>,
        arguments: Value,
    ) -> Result<()> {
        let bridge = self.bridge()?;
        self.note_pending_call();
        bridge
            .call_function(module.into(), method.into(), arguments)
            .inspect_err(|_| self.retract_pending_call())
    }

    pub fn invoke_callback(&self, callback_id: u64, arguments: Value) -> Result<()> {
        let bridge = self.bridge()?;
        self.note_pending_call();
        bridge
            .invoke_callback(callback_id, arguments)
            .inspect_err(|_| self.retract_pending_call())
    }

    pub fn set_global_variable(&self, name: impl Into<String>, json_value: JsBigString) -> Result<()> {
        self.bridge()?.set_global_variable(name.into(), json_value)
    }

    pub fn handle_memory_pressure(&self, level: MemoryPressureLevel) -> Result<()> {
        self.bridge()?.handle_memory_pressure(level)
    }

    pub fn java_script_context(&self) -> Option<JsContextHandle> {
        self.bridge().ok().and_then(|bridge| bridge.java_script_context())
    }

    pub fn is_inspectable(&self) -> bool {
        self.bridge().is_ok_and(|bridge| bridge.is_inspectable())
    }

    pub fn is_batch_active(&self) -> bool {
        self.bridge().is_ok_and(|bridge| bridge.is_batch_active())
    }

    /// Calls submitted into JavaScript over the environment's lifetime.
    pub fn pending_calls(&self) -> u64 {
        self.pending_calls.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> EnvironmentSnapshot {
        let state = self.lock_state();
        EnvironmentSnapshot {
            id: self.id.clone(),
            ready: state.bridge.is_some(),
            disposed: state.disposed,
            pending_calls: self.pending_calls(),
            created_at: self.created_at,
            ready_at: state.ready_at,
        }
    }

    fn bridge(&self) -> Result<Arc<NativeToJsBridge>> {
        let state = self.lock_state();
        match (&state.bridge, state.disposed) {
            (Some(bridge), false) => Ok(Arc::clone(bridge)),
            _ => Err(self.not_ready()),
        }
    }

    fn note_pending_call(&self) {
        self.pending_calls.fetch_add(1, Ordering::SeqCst);
        self.collaborators.callback.increment_pending_js_calls();
    }

    /// The submission never reached the queue.
    fn retract_pending_call(&self) {
        self.pending_calls.fetch_sub(1, Ordering::SeqCst);
        self.collaborators.callback.decrement_pending_js_calls();
    }

    fn not_ready(&self) -> KeelError {
        KeelError::NotReadyOrDisposed {
            environment: self.id.clone(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EnvState> {
        self.state.lock().expect("environment state lock poisoned")
    }
}
