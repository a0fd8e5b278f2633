// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bridge configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KeelError, Result};
use crate::types::{DEFAULT_ENVIRONMENT_NAME, EnvironmentId};

/// Settings for an `Instance` and the script threads it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Name of the environment the single-environment facade talks to.
    pub default_environment: String,
    /// Thread name prefix for script queue threads.
    pub script_thread_name: String,
    /// Stack size for script queue threads (platform default when unset).
    pub script_thread_stack_size: Option<usize>,
    /// Notify the pending-call counter when a bundle is loaded asynchronously.
    pub load_async_counts_as_pending_call: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_environment: DEFAULT_ENVIRONMENT_NAME.to_string(),
            script_thread_name: "keel-js".to_string(),
            script_thread_stack_size: None,
            load_async_counts_as_pending_call: true,
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn default_environment_id(&self) -> EnvironmentId {
        EnvironmentId::named(self.default_environment.clone())
    }

    fn validate(&self) -> Result<()> {
        if self.default_environment.trim().is_empty() {
            return Err(KeelError::Config(
                "default_environment must not be empty".into(),
            ));
        }
        if self.script_thread_name.contains('\0') {
            return Err(KeelError::Config(
                "script_thread_name must not contain NUL".into(),
            ));
        }
        Ok(())
    }
}
