// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Instance facade.
//
// The single-environment entry point: one registry, one default environment,
// and a readiness latch that synchronous bundle loads wait on.  Every call
// resolves the default environment afresh, so it is safe against concurrent
// teardown.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use keel_bridge::{InstanceCallback, JsExecutorFactory, ModuleRegistry, ScriptQueue};
use keel_bundle::Bundle;
use keel_core::error::{KeelError, Result};
use keel_core::{
    BridgeConfig, EnvironmentId, EnvironmentSnapshot, JsBigString, JsContextHandle,
    MemoryPressureLevel,
};
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use crate::environment::{ExecutionEnvironment, usage_violation};
use crate::latch::Latch;
use crate::registry::{Collaborators, EnvironmentRegistry};

/// Outcome of the default environment's preload, as seen by the sync gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Failed(String),
}

struct Initialized {
    registry: EnvironmentRegistry,
    module_registry: Arc<dyn ModuleRegistry>,
    callback: Arc<dyn InstanceCallback>,
}

pub struct Instance {
    config: BridgeConfig,
    default_environment: EnvironmentId,
    bridge: OnceLock<Initialized>,
    gate: Arc<Latch<Readiness>>,
}

impl Instance {
    pub fn new(config: BridgeConfig) -> Self {
        let default_environment = config.default_environment_id();
        Self {
            config,
            default_environment,
            bridge: OnceLock::new(),
            gate: Arc::new(Latch::new()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn default_environment_id(&self) -> &EnvironmentId {
        &self.default_environment
    }

    /// Build the environment registry and start preloading the default
    /// environment.  The sync gate opens when that preload finishes.
    ///
    /// May be called once per instance; a second call is a usage error (a
    /// panic in debug builds).
    #[instrument(skip_all, fields(environment = %self.default_environment))]
    pub fn initialize_bridge(
        &self,
        callback: Arc<dyn InstanceCallback>,
        executor_factory: Arc<dyn JsExecutorFactory>,
        script_queue: Arc<dyn ScriptQueue>,
        module_registry: Arc<dyn ModuleRegistry>,
    ) -> Result<()> {
        if self.bridge.get().is_some() {
            return Err(usage_violation("bridge is already initialized".into()));
        }

        let registry = EnvironmentRegistry::with_shared_queue(
            Collaborators {
                executor_factory,
                module_registry: Arc::clone(&module_registry),
                callback: Arc::clone(&callback),
            },
            script_queue,
        );
        let initialized = Initialized {
            registry,
            module_registry,
            callback,
        };
        if self.bridge.set(initialized).is_err() {
            return Err(usage_violation(
                "bridge is already initialized by a concurrent call".into(),
            ));
        }
        let registry = &self.initialized()?.registry;

        let gate = Arc::clone(&self.gate);
        let preloaded = registry.preload_environment(&self.default_environment, move |result| {
            let readiness = match result {
                Ok(()) => Readiness::Ready,
                Err(e) => Readiness::Failed(e.to_string()),
            };
            if !gate.set(readiness) {
                debug!("sync gate already set");
            }
        });
        if let Err(e) = &preloaded {
            self.gate.set(Readiness::Failed(e.to_string()));
        }
        preloaded?;
        info!("bridge initialized");
        Ok(())
    }

    // -- Bundles -------------------------------------------------------------

    /// Load `bundle` into the default environment, waiting for it to be
    /// ready first when `synchronous` is set.
    pub fn load_bundle(&self, bundle: Box<dyn Bundle>, synchronous: bool) -> Result<()> {
        if synchronous {
            self.load_bundle_sync(bundle)
        } else {
            self.load_bundle_async(bundle)
        }
    }

    /// Queue `bundle` behind the preload and return immediately.
    #[instrument(skip_all, fields(environment = %self.default_environment, source_url = bundle.source_url()))]
    pub fn load_bundle_async(&self, bundle: Box<dyn Bundle>) -> Result<()> {
        let initialized = self.initialized()?;
        let counted = self.config.load_async_counts_as_pending_call;
        if counted {
            initialized.callback.increment_pending_js_calls();
        }
        initialized
            .registry
            .run_in_environment(&self.default_environment, bundle)
            .inspect_err(|_| {
                if counted {
                    initialized.callback.decrement_pending_js_calls();
                }
            })
    }

    /// Block until the default environment is ready, then queue `bundle`.
    #[instrument(skip_all, fields(environment = %self.default_environment, source_url = bundle.source_url()))]
    pub fn load_bundle_sync(&self, bundle: Box<dyn Bundle>) -> Result<()> {
        let initialized = self.initialized()?;
        debug!("waiting for default environment");
        match self.gate.wait() {
            Readiness::Ready => initialized
                .registry
                .run_in_environment(&self.default_environment, bundle),
            Readiness::Failed(message) => {
                // A disposed environment reports itself; anything else is the
                // preload's own failure.
                self.environment()?;
                Err(KeelError::Executor(message))
            }
        }
    }

    /// Make another indexed bundle segment available to `require`.
    pub fn register_bundle(&self, segment_id: u32, path: impl Into<PathBuf>) -> Result<()> {
        self.environment()?.register_bundle(segment_id, path)
    }

    // -- Forwarding ----------------------------------------------------------

    pub fn call_js_function(
        &self,
        module: impl Into<String>,
        method: impl Into<String>,
        arguments: Value,
    ) -> Result<()> {
        self.environment()?.call_function(module, method, arguments)
    }

    pub fn call_js_callback(&self, callback_id: u64, arguments: Value) -> Result<()> {
        self.environment()?.invoke_callback(callback_id, arguments)
    }

    pub fn set_global_variable(&self, name: impl Into<String>, json_value: JsBigString) -> Result<()> {
        self.environment()?.set_global_variable(name, json_value)
    }

    pub fn handle_memory_pressure(&self, level: MemoryPressureLevel) -> Result<()> {
        self.environment()?.handle_memory_pressure(level)
    }

    // -- Queries (never fail) -------------------------------------------------

    /// `None` until the default environment is ready.
    pub fn get_java_script_context(&self) -> Option<JsContextHandle> {
        self.environment().ok()?.java_script_context()
    }

    pub fn is_inspectable(&self) -> bool {
        self.environment().is_ok_and(|env| env.is_inspectable())
    }

    pub fn is_batch_active(&self) -> bool {
        self.environment().is_ok_and(|env| env.is_batch_active())
    }

    /// Where the sync gate stands, without waiting.
    pub fn readiness(&self) -> Option<Readiness> {
        self.gate.try_get()
    }

    pub fn module_registry(&self) -> Result<Arc<dyn ModuleRegistry>> {
        Ok(Arc::clone(&self.initialized()?.module_registry))
    }

    pub fn environment_snapshot(&self) -> Option<EnvironmentSnapshot> {
        self.bridge
            .get()?
            .registry
            .snapshot(&self.default_environment)
    }

    /// The underlying registry, for hosts that run extra environments.
    pub fn registry(&self) -> Option<&EnvironmentRegistry> {
        self.bridge.get().map(|initialized| &initialized.registry)
    }

    fn initialized(&self) -> Result<&Initialized> {
        self.bridge.get().ok_or_else(|| {
            error!("instance used before initialize_bridge");
            KeelError::Usage("initialize_bridge has not been called".into())
        })
    }

    fn environment(&self) -> Result<Arc<ExecutionEnvironment>> {
        match self.bridge.get() {
            Some(initialized) => initialized
                .registry
                .get_environment(&self.default_environment)
                .resolve(),
            None => Err(KeelError::NotReadyOrDisposed {
                environment: self.default_environment.clone(),
            }),
        }
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Some(initialized) = self.bridge.get() {
            initialized.registry.dispose_environments();
        }
        self.gate.set(Readiness::Failed("instance destroyed".into()));
        debug!(environment = %self.default_environment, "instance destroyed");
    }
}
