// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bundle handles.
//
// A bundle is produced by the surrounding loader and handed to Keel by
// exclusive ownership (`Box<dyn Bundle>`); it is consumed exactly once.

use std::path::{Path, PathBuf};

use keel_core::error::Result;
use keel_core::{JsBigString, ScriptTag};
use sha2::{Digest, Sha256};

use crate::header::{sniff_bytes, sniff_path};

/// Compiled or source JavaScript content identified by a source URL.
pub trait Bundle: Send {
    /// URL reported in stack traces and logs.
    fn source_url(&self) -> &str;

    /// Location on disk, for bundles backed by a file.
    fn source_path(&self) -> Option<&Path> {
        None
    }

    /// The bundle's bytes.  File-backed bundles read them on each call.
    fn script(&self) -> Result<JsBigString>;

    /// Classify the bundle, reading only the header when a path is known.
    fn script_tag(&self) -> ScriptTag {
        match self.source_path() {
            Some(path) => sniff_path(path),
            None => self
                .script()
                .map(|script| sniff_bytes(script.as_bytes()))
                .unwrap_or(ScriptTag::PlainScript),
        }
    }
}

/// A bundle held entirely in memory.
#[derive(Debug, Clone)]
pub struct StringBundle {
    source_url: String,
    script: JsBigString,
}

impl StringBundle {
    pub fn new(source_url: impl Into<String>, script: impl Into<JsBigString>) -> Self {
        Self {
            source_url: source_url.into(),
            script: script.into(),
        }
    }
}

impl Bundle for StringBundle {
    fn source_url(&self) -> &str {
        &self.source_url
    }

    fn script(&self) -> Result<JsBigString> {
        Ok(self.script.clone())
    }
}

/// A bundle read from disk on demand.
#[derive(Debug, Clone)]
pub struct FileBundle {
    source_url: String,
    path: PathBuf,
}

impl FileBundle {
    /// The source URL defaults to the path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source_url: path.display().to_string(),
            path,
        }
    }

    pub fn with_source_url(mut self, source_url: impl Into<String>) -> Self {
        self.source_url = source_url.into();
        self
    }
}

impl Bundle for FileBundle {
    fn source_url(&self) -> &str {
        &self.source_url
    }

    fn source_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn script(&self) -> Result<JsBigString> {
        Ok(std::fs::read(&self.path)?.into())
    }
}

/// SHA-256 of `script` as lowercase hex, used to identify loaded bundles in logs.
pub fn fingerprint(script: &JsBigString) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    hex::encode(hasher.finalize())
}
