// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Keel JavaScript bridge.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the environment used when an application hosts a single one.
pub const DEFAULT_ENVIRONMENT_NAME: &str = "default";

/// Identifies one execution environment within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    /// A fresh, unique identifier.
    pub fn new() -> Self {
        Self(format!("env-{}", Uuid::new_v4()))
    }

    /// An identifier with a caller-chosen name.
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The well-known default environment.
impl Default for EnvironmentId {
    fn default() -> Self {
        Self::named(DEFAULT_ENVIRONMENT_NAME)
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a bundle's content has to be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptTag {
    /// A monolithic script, executed as a whole.
    PlainScript,
    /// An indexed ("RAM") bundle whose modules are loaded on first reference.
    IndexedBundle,
}

/// Memory pressure reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryPressureLevel {
    /// The UI went to the background.
    UiHidden,
    /// The system is running low and the process is a candidate for trimming.
    Moderate,
    /// The process is about to be killed unless memory is released.
    Critical,
}

impl MemoryPressureLevel {
    /// Map a raw platform trim level onto a pressure level.
    ///
    /// Unknown values are treated as `Moderate`.
    pub fn from_raw(level: i32) -> Self {
        match level {
            20 => Self::UiHidden,
            10 | 15 => Self::Critical,
            _ => Self::Moderate,
        }
    }

    /// The raw platform trim level.
    pub fn as_raw(&self) -> i32 {
        match self {
            Self::UiHidden => 20,
            Self::Moderate => 5,
            Self::Critical => 15,
        }
    }
}

/// Immutable, cheaply clonable buffer of script source or JSON text.
#[derive(Clone, PartialEq, Eq)]
pub struct JsBigString {
    bytes: Arc<[u8]>,
}

impl JsBigString {
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The content as UTF-8, replacing invalid sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

impl From<String> for JsBigString {
    fn from(value: String) -> Self {
        Self::from_bytes(value.into_bytes())
    }
}

impl From<&str> for JsBigString {
    fn from(value: &str) -> Self {
        Self::from_bytes(value.as_bytes())
    }
}

impl From<Vec<u8>> for JsBigString {
    fn from(value: Vec<u8>) -> Self {
        Self::from_bytes(value)
    }
}

impl fmt::Debug for JsBigString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsBigString")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Opaque handle to an engine's native context, for debuggers and profilers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JsContextHandle(pub usize);

/// Point-in-time view of one execution environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub id: EnvironmentId,
    /// The call-forwarding bridge is installed.
    pub ready: bool,
    pub disposed: bool,
    /// Calls submitted into JavaScript since creation.
    pub pending_calls: u64,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
}
