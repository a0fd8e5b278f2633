// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bundle header sniffing.
//
// Every bundle starts with a fixed 12-byte header.  Only the magic field is
// inspected: it equals `INDEXED_BUNDLE_MAGIC` exactly when the bundle is an
// indexed (RAM) bundle.  Anything else, including a missing or truncated
// header, is a plain script.  A plain script that is not valid JavaScript is
// the executor's problem, not the sniffer's.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use keel_core::ScriptTag;
use tracing::debug;

/// Magic number stored (little-endian) at offset 0 of an indexed bundle.
pub const INDEXED_BUNDLE_MAGIC: u32 = 0xFB0B_D1E5;

/// Size of the bundle header in bytes.
pub const HEADER_SIZE: usize = 12;

/// The fixed-size prefix of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleHeader {
    pub magic: u32,
    pub reserved: u32,
    pub version: u32,
}

impl BundleHeader {
    /// Decode a header from the start of `bytes`.
    ///
    /// Returns `None` when fewer than `HEADER_SIZE` bytes are available.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            magic: read_u32_le(bytes, 0)?,
            reserved: read_u32_le(bytes, 4)?,
            version: read_u32_le(bytes, 8)?,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.reserved.to_le_bytes());
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    pub fn script_tag(&self) -> ScriptTag {
        if self.magic == INDEXED_BUNDLE_MAGIC {
            ScriptTag::IndexedBundle
        } else {
            ScriptTag::PlainScript
        }
    }
}

/// Classify an in-memory buffer.
///
/// Exactly `HEADER_SIZE` bytes are inspected.  A shorter buffer is a plain
/// script, the same fail-safe rule `sniff_path` applies to short files.
pub fn sniff_bytes(bytes: &[u8]) -> ScriptTag {
    match BundleHeader::from_bytes(bytes) {
        Some(header) => header.script_tag(),
        None => {
            debug!(len = bytes.len(), "buffer shorter than bundle header, treating as plain script");
            ScriptTag::PlainScript
        }
    }
}

/// Classify the bundle stored at `path` by reading only its header.
///
/// Never fails: an unreadable file or a short read classifies as a plain
/// script.
pub fn sniff_path(path: impl AsRef<Path>) -> ScriptTag {
    let path = path.as_ref();
    let mut raw = [0u8; HEADER_SIZE];
    let read = File::open(path).and_then(|mut file| file.read_exact(&mut raw));
    match read {
        Ok(()) => sniff_bytes(&raw),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "bundle header unreadable, treating as plain script");
            ScriptTag::PlainScript
        }
    }
}

/// Little-endian `u32` at `offset`, if in bounds.
pub(crate) fn read_u32_le(bytes: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let raw: [u8; 4] = bytes.get(offset..end)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}
