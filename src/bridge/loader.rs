//! Module binary validation
//!
//! Checks a variant's bytes before they are handed to an instantiator:
//! WASM header, then the export section must provide the linear memory
//! and the allocator pair.

use super::abi::{Variant, exports};
use super::error::{BridgeError, BridgeResult};

/// WASM magic number: \0asm
const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

/// WASM version 1
const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Export section id
const EXPORT_SECTION: u8 = 7;

/// External kind of an export entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Function,
    Table,
    Memory,
    Global,
    Other(u8),
}

impl ExportKind {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0 => ExportKind::Function,
            1 => ExportKind::Table,
            2 => ExportKind::Memory,
            3 => ExportKind::Global,
            other => ExportKind::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            ExportKind::Function => 0,
            ExportKind::Table => 1,
            ExportKind::Memory => 2,
            ExportKind::Global => 3,
            ExportKind::Other(b) => b,
        }
    }
}

/// One entry of the export section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

/// Validates module binaries against the bridge ABI
pub struct ModuleValidator;

impl ModuleValidator {
    /// Validate the binary of `variant`.
    ///
    /// Checks:
    /// - Valid WASM magic number and version
    /// - `memory` is exported as a memory
    /// - `alloc_bytes` and `free_bytes` are exported as functions
    ///
    /// Returns the export table on success. Any failure is an
    /// `InstantiationFailed` for `variant`.
    pub fn validate(variant: Variant, bytes: &[u8]) -> BridgeResult<Vec<ExportEntry>> {
        let fail = |reason: String| BridgeError::InstantiationFailed { variant, reason };

        let entries = Self::exports(bytes).map_err(fail)?;
        let required = [
            (exports::MEMORY, ExportKind::Memory),
            (exports::ALLOC, ExportKind::Function),
            (exports::FREE, ExportKind::Function),
        ];
        for (name, kind) in required {
            Self::require(&entries, name, kind).map_err(|e| fail(e.to_string()))?;
        }
        Ok(entries)
    }

    /// Parse the header and collect every export entry
    pub fn exports(bytes: &[u8]) -> Result<Vec<ExportEntry>, String> {
        // Check minimum size (magic + version)
        if bytes.len() < 8 {
            return Err("module too small".to_string());
        }
        if bytes[0..4] != WASM_MAGIC {
            return Err("invalid magic number".to_string());
        }
        if bytes[4..8] != WASM_VERSION {
            return Err("unsupported WASM version".to_string());
        }

        let mut entries = Vec::new();
        let mut offset = 8;
        while offset < bytes.len() {
            let section_id = bytes[offset];
            offset += 1;

            let (size, size_bytes) = read_leb128(&bytes[offset..])?;
            offset += size_bytes;

            let section_end = offset
                .checked_add(size as usize)
                .filter(|&end| end <= bytes.len())
                .ok_or_else(|| "section extends past end of module".to_string())?;

            if section_id == EXPORT_SECTION {
                entries.extend(parse_export_section(&bytes[offset..section_end])?);
            }
            offset = section_end;
        }
        Ok(entries)
    }

    fn require(entries: &[ExportEntry], name: &str, kind: ExportKind) -> BridgeResult<()> {
        let entry = entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| BridgeError::MissingExport {
                name: name.to_string(),
            })?;
        if entry.kind != kind {
            return Err(BridgeError::WrongExportType {
                name: name.to_string(),
                expected: match kind {
                    ExportKind::Memory => "memory",
                    _ => "function",
                },
            });
        }
        Ok(())
    }
}

/// Read an unsigned LEB128 value
fn read_leb128(bytes: &[u8]) -> Result<(u32, usize), String> {
    let mut result = 0u32;
    let mut shift = 0;
    let mut bytes_read = 0;

    for &byte in bytes.iter().take(5) {
        bytes_read += 1;
        result |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, bytes_read));
        }
        shift += 7;
    }

    Err("invalid LEB128".to_string())
}

fn parse_export_section(data: &[u8]) -> Result<Vec<ExportEntry>, String> {
    let mut entries = Vec::new();
    if data.is_empty() {
        return Ok(entries);
    }

    let (count, mut offset) = read_leb128(data)?;
    for _ in 0..count {
        let (name_len, len_bytes) = read_leb128(&data[offset..])?;
        offset += len_bytes;

        let name_end = offset
            .checked_add(name_len as usize)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| "export name extends past section".to_string())?;
        let name = String::from_utf8_lossy(&data[offset..name_end]).to_string();
        offset = name_end;

        let kind = *data
            .get(offset)
            .ok_or_else(|| "unexpected end of export section".to_string())?;
        offset += 1;

        let (index, index_bytes) = read_leb128(&data[offset..])?;
        offset += index_bytes;

        entries.push(ExportEntry {
            name,
            kind: ExportKind::from_byte(kind),
            index,
        });
    }
    Ok(entries)
}

/// Minimal binary with only an export section, for tests
#[cfg(test)]
pub(crate) fn module_bytes(entries: &[(&str, ExportKind)]) -> Vec<u8> {
    let mut section = vec![entries.len() as u8];
    for (i, (name, kind)) in entries.iter().enumerate() {
        section.push(name.len() as u8);
        section.extend_from_slice(name.as_bytes());
        section.push(kind.as_byte());
        section.push(i as u8);
    }

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&WASM_MAGIC);
    bytes.extend_from_slice(&WASM_VERSION);
    bytes.push(EXPORT_SECTION);
    bytes.push(section.len() as u8);
    bytes.extend(section);
    bytes
}

/// Binary exporting the full bridge ABI, for tests
#[cfg(test)]
pub(crate) fn abi_module_bytes() -> Vec<u8> {
    module_bytes(&[
        (exports::MEMORY, ExportKind::Memory),
        (exports::ALLOC, ExportKind::Function),
        (exports::FREE, ExportKind::Function),
    ])
}
