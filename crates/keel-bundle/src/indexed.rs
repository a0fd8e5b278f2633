// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Indexed (RAM) bundle reader.
//
// Layout, all integers little-endian:
//
//   magic: u32 | entry_count: u32 | startup_code_size: u32
//   entry_count x { offset: u32, length: u32 }
//   startup code (startup_code_size bytes, NUL-terminated)
//   module bodies (each NUL-terminated)
//
// Module offsets are relative to the end of the table.  Lengths include the
// trailing NUL, which is stripped on read.  A table entry with length 0 means
// the module id has no code.

use keel_core::JsBigString;
use keel_core::error::{KeelError, Result};

use crate::header::{HEADER_SIZE, INDEXED_BUNDLE_MAGIC, read_u32_le};

const ENTRY_SIZE: usize = 8;

/// Source of a single lazily-loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    /// Synthetic URL used in stack traces, e.g. `"12.js"`.
    pub url: String,
    pub code: String,
}

#[derive(Debug, Clone, Copy)]
struct TableEntry {
    offset: u32,
    length: u32,
}

/// A parsed indexed bundle.  Module bodies stay in the shared buffer until
/// requested.
#[derive(Debug, Clone)]
pub struct IndexedBundle {
    bytes: JsBigString,
    table: Vec<TableEntry>,
    base_offset: usize,
    startup_code_size: usize,
}

impl IndexedBundle {
    /// Parse the header and module table of `bytes`.
    pub fn parse(bytes: JsBigString) -> Result<Self> {
        let data = bytes.as_bytes();
        let magic = read_u32_le(data, 0)
            .ok_or_else(|| KeelError::InvalidBundle("truncated header".into()))?;
        if magic != INDEXED_BUNDLE_MAGIC {
            return Err(KeelError::InvalidBundle(format!(
                "bad magic {magic:#010x}"
            )));
        }
        let entry_count = read_u32_le(data, 4)
            .ok_or_else(|| KeelError::InvalidBundle("truncated header".into()))?
            as usize;
        let startup_code_size = read_u32_le(data, 8)
            .ok_or_else(|| KeelError::InvalidBundle("truncated header".into()))?
            as usize;

        let base_offset = entry_count
            .checked_mul(ENTRY_SIZE)
            .and_then(|table_len| table_len.checked_add(HEADER_SIZE))
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                KeelError::InvalidBundle(format!(
                    "module table of {entry_count} entries exceeds bundle size {}",
                    data.len()
                ))
            })?;

        if base_offset
            .checked_add(startup_code_size)
            .is_none_or(|end| end > data.len())
        {
            return Err(KeelError::InvalidBundle(format!(
                "startup code of {startup_code_size} bytes exceeds bundle size {}",
                data.len()
            )));
        }

        let mut table = Vec::with_capacity(entry_count);
        for index in 0..entry_count {
            let at = HEADER_SIZE + index * ENTRY_SIZE;
            // In bounds: the whole table was checked above.
            let offset = read_u32_le(data, at).unwrap_or_default();
            let length = read_u32_le(data, at + 4).unwrap_or_default();
            table.push(TableEntry { offset, length });
        }

        Ok(Self {
            bytes,
            table,
            base_offset,
            startup_code_size,
        })
    }

    /// Number of module ids in the table, including ids without code.
    pub fn module_count(&self) -> usize {
        self.table.len()
    }

    /// The code executed when the bundle is loaded.
    pub fn startup_code(&self) -> JsBigString {
        let len = self.startup_code_size.saturating_sub(1);
        let start = self.base_offset;
        JsBigString::from_bytes(&self.bytes.as_bytes()[start..start + len])
    }

    /// Extract one module's source.
    pub fn module(&self, module_id: u32) -> Result<ModuleSource> {
        self.module_in_segment(0, module_id)
    }

    pub(crate) fn module_in_segment(&self, segment: u32, module_id: u32) -> Result<ModuleSource> {
        let entry = self
            .table
            .get(module_id as usize)
            .filter(|entry| entry.length > 0)
            .ok_or(KeelError::ModuleNotFound {
                segment,
                module: module_id,
            })?;

        let data = self.bytes.as_bytes();
        let start = self.base_offset + entry.offset as usize;
        let end = start + (entry.length as usize - 1);
        let raw = data.get(start..end).ok_or_else(|| {
            KeelError::InvalidBundle(format!(
                "module {module_id} spans {start}..{end} beyond bundle size {}",
                data.len()
            ))
        })?;
        let code = String::from_utf8(raw.to_vec()).map_err(|e| {
            KeelError::InvalidBundle(format!("module {module_id} is not UTF-8: {e}"))
        })?;

        Ok(ModuleSource {
            url: format!("{module_id}.js"),
            code,
        })
    }
}

/// Encode an indexed bundle.
///
/// `modules[i]` is the body of module id `i`; `None` leaves the id without
/// code.  Used by packaging tools and tests.
pub fn write_indexed_bundle(startup_code: &str, modules: &[Option<&str>]) -> Vec<u8> {
    let mut table = Vec::with_capacity(modules.len() * ENTRY_SIZE);
    let mut bodies = Vec::new();
    let mut offset = startup_code.len() + 1;
    for module in modules {
        match module {
            Some(code) => {
                table.extend_from_slice(&(offset as u32).to_le_bytes());
                table.extend_from_slice(&((code.len() + 1) as u32).to_le_bytes());
                bodies.extend_from_slice(code.as_bytes());
                bodies.push(0);
                offset += code.len() + 1;
            }
            None => table.extend_from_slice(&[0u8; ENTRY_SIZE]),
        }
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + table.len() + offset);
    out.extend_from_slice(&INDEXED_BUNDLE_MAGIC.to_le_bytes());
    out.extend_from_slice(&(modules.len() as u32).to_le_bytes());
    out.extend_from_slice(&((startup_code.len() + 1) as u32).to_le_bytes());
    out.extend_from_slice(&table);
    out.extend_from_slice(startup_code.as_bytes());
    out.push(0);
    out.extend_from_slice(&bodies);
    out
}
