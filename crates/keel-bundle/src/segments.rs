// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Lazy segment registry for indexed bundles.
//
// The main bundle is segment 0.  Further segments are registered by path and
// only opened when a module from them is first requested; parsed segments are
// cached for the lifetime of the registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use keel_core::error::{KeelError, Result};
use tracing::{debug, info};

use crate::indexed::{IndexedBundle, ModuleSource};

/// Segment id of the bundle the environment was loaded from.
pub const MAIN_SEGMENT_ID: u32 = 0;

#[derive(Default)]
struct Segments {
    loaded: HashMap<u32, Arc<IndexedBundle>>,
    registered: HashMap<u32, PathBuf>,
}

/// Demand-loads modules from the main indexed bundle and any registered
/// segments.  Shared between the native side (which registers segments) and
/// the script thread (which fetches modules).
pub struct RamBundleRegistry {
    segments: Mutex<Segments>,
}

impl RamBundleRegistry {
    /// A registry whose segment 0 is `main`.
    pub fn new(main: IndexedBundle) -> Self {
        let mut segments = Segments::default();
        segments.loaded.insert(MAIN_SEGMENT_ID, Arc::new(main));
        Self {
            segments: Mutex::new(segments),
        }
    }

    /// Make the bundle at `path` available as `segment_id`.
    ///
    /// The file is not touched until a module from it is requested.
    /// Re-registering an unopened segment replaces its path.
    pub fn register_segment(&self, segment_id: u32, path: impl Into<PathBuf>) -> Result<()> {
        if segment_id == MAIN_SEGMENT_ID {
            return Err(KeelError::Usage(
                "segment 0 is the main bundle and cannot be re-registered".into(),
            ));
        }
        let path = path.into();
        let mut segments = self.segments.lock().expect("segments lock poisoned");
        if segments.loaded.contains_key(&segment_id) {
            return Err(KeelError::Usage(format!(
                "segment {segment_id} is already loaded"
            )));
        }
        info!(segment_id, path = %path.display(), "bundle segment registered");
        segments.registered.insert(segment_id, path);
        Ok(())
    }

    /// Fetch the source of `module_id` from `segment_id`.
    pub fn module(&self, segment_id: u32, module_id: u32) -> Result<ModuleSource> {
        let bundle = self.segment(segment_id, module_id)?;
        bundle.module_in_segment(segment_id, module_id)
    }

    /// Whether `segment_id` is loaded or registered.
    pub fn has_segment(&self, segment_id: u32) -> bool {
        let segments = self.segments.lock().expect("segments lock poisoned");
        segments.loaded.contains_key(&segment_id) || segments.registered.contains_key(&segment_id)
    }

    fn segment(&self, segment_id: u32, module_id: u32) -> Result<Arc<IndexedBundle>> {
        let path = {
            let segments = self.segments.lock().expect("segments lock poisoned");
            if let Some(bundle) = segments.loaded.get(&segment_id) {
                return Ok(Arc::clone(bundle));
            }
            segments
                .registered
                .get(&segment_id)
                .cloned()
                .ok_or(KeelError::ModuleNotFound {
                    segment: segment_id,
                    module: module_id,
                })?
        };

        // Read outside the lock; a concurrent open of the same segment loses
        // the race below and its copy is dropped.
        let bytes = std::fs::read(&path)?;
        let parsed = IndexedBundle::parse(bytes.into())?;
        debug!(segment_id, modules = parsed.module_count(), "bundle segment opened");

        let mut segments = self.segments.lock().expect("segments lock poisoned");
        let bundle = segments
            .loaded
            .entry(segment_id)
            .or_insert_with(|| Arc::new(parsed));
        Ok(Arc::clone(bundle))
    }
}
