//! Bridge ABI types and constants
//!
//! This module defines the stable interface between the host and a bridged
//! module: the export names every variant must provide, the transform call
//! shape, and how a transform's signed return value is read.

use serde::{Deserialize, Serialize};
use std::fmt;

/// ABI version number
pub const ABI_VERSION: u32 = 1;

/// Export names
pub mod exports {
    /// The linear memory export name
    pub const MEMORY: &str = "memory";
    /// `alloc_bytes(len: u32) -> u32`
    pub const ALLOC: &str = "alloc_bytes";
    /// `free_bytes(ptr: u32, len: u32)`
    pub const FREE: &str = "free_bytes";
    /// Optional: `version() -> u32`, identifies the build
    pub const VERSION: &str = "version";

    /// Exports every variant must provide
    pub const REQUIRED: [&str; 3] = [MEMORY, ALLOC, FREE];
}

/// Import module namespace
pub const IMPORT_NAMESPACE: &str = "env";

/// WASM page size in bytes
pub const PAGE_SIZE: usize = 65536;

/// Smallest module using a `v128` instruction.
///
/// `() -> v128 { i32.const 0; i8x16.splat; i8x16.popcnt }`. A host that
/// validates these bytes can run the SIMD variant.
pub const SIMD_PROBE: [u8; 31] = [
    0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, // header
    0x01, 0x05, 0x01, 0x60, 0x00, 0x01, 0x7B, // type: () -> v128
    0x03, 0x02, 0x01, 0x00, // func 0: type 0
    0x0A, 0x0A, 0x01, 0x08, 0x00, 0x41, 0x00, 0xFD, 0x0F, 0xFD, 0x62, 0x0B, // code
];

/// One of the two builds of a bridged module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Built with `target-feature=+simd128`
    Simd,
    /// Baseline build, runs everywhere
    Base,
}

impl Variant {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Variant::Simd => "simd",
            Variant::Base => "base",
        }
    }

    /// File name of this variant's binary: `<module>_<variant>.wasm`
    pub fn file_name(&self, module: &str) -> String {
        format!("{}_{}.wasm", module, self.as_str())
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of a transform export:
/// `name(in_ptr, in_len, out_ptr, out_cap) -> i32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformArgs {
    pub in_ptr: u32,
    pub in_len: u32,
    pub out_ptr: u32,
    pub out_cap: u32,
}

impl TransformArgs {
    pub fn as_array(&self) -> [u32; 4] {
        [self.in_ptr, self.in_len, self.out_ptr, self.out_cap]
    }
}

/// Interpret a transform's return value.
///
/// Non-negative: number of bytes written at `out_ptr`.
/// Negative: the magnitude is the foreign error code.
pub fn interpret_return(ret: i32) -> Result<u32, u32> {
    if ret < 0 {
        Err(ret.unsigned_abs())
    } else {
        Ok(ret as u32)
    }
}
