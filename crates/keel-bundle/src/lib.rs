// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// keel-bundle — Everything Keel knows about bundle bytes: header sniffing,
// the `Bundle` handle, the indexed (RAM) bundle layout, and the registry that
// opens additional bundle segments on demand.

pub mod header;
pub mod indexed;
pub mod segments;
pub mod source;

pub use header::{BundleHeader, HEADER_SIZE, INDEXED_BUNDLE_MAGIC, sniff_bytes, sniff_path};
pub use indexed::{IndexedBundle, ModuleSource, write_indexed_bundle};
pub use segments::{MAIN_SEGMENT_ID, RamBundleRegistry};
pub use source::{Bundle, FileBundle, StringBundle, fingerprint};
