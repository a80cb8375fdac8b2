//! Dual-variant module bridge
//!
//! This module hosts a WASM module that is shipped in two builds, one
//! compiled with `simd128` and one baseline build, and exposes its byte
//! transforms as ordinary calls.
//!
//! # Design
//!
//! - **Selection**: the SIMD build is tried first and the baseline is the
//!   fallback, as an explicit two-attempt strategy
//! - **One active module**: an [`InstanceRegistry`] holds the live handle and
//!   a memory view that is rebuilt whenever memory has grown
//! - **Foreign allocation**: the host only holds `(ptr, len)` pairs; every
//!   buffer comes from the module's own allocator and goes back to it on
//!   every path
//! - **Data-driven dispatch**: wrapped functions are a table of
//!   [`FunctionDescriptor`]s interpreted by one generic marshaller
//!
//! # ABI Specification v1
//!
//! ## Required Exports
//!
//! | Export        | Type                              | Description                      |
//! |---------------|-----------------------------------|----------------------------------|
//! | `memory`      | Memory                            | Growable linear memory           |
//! | `alloc_bytes` | `(len: u32) -> u32`               | Allocate; 0 on failure           |
//! | `free_bytes`  | `(ptr: u32, len: u32)`            | Free an exact allocation         |
//!
//! Optional exports:
//!
//! | Export    | Type         | Description                               |
//! |-----------|--------------|-------------------------------------------|
//! | `version` | `() -> u32`  | Build identifier, useful to tell variants |
//!
//! ## Transform Exports
//!
//! ```text
//! name(in_ptr: u32, in_len: u32, out_ptr: u32, out_cap: u32) -> i32
//!   Reads in_len bytes at in_ptr, writes at most out_cap bytes at out_ptr.
//!   Returns bytes written (>= 0), or a negative error code.
//! ```
//!
//! The host passes the real capacity of the output buffer. A return value
//! larger than `out_cap` is rejected as malformed output.
//!
//! ## Imports
//!
//! Host imports, if any, are provided in the `env` namespace.
//!
//! ## Variant Files
//!
//! ```text
//! <module>_simd.wasm   built with -C target-feature=+simd128
//! <module>_base.wasm   baseline build
//! ```
//!
//! ## Return Kinds
//!
//! | Kind                      | Output capacity          | Decoded as                 |
//! |---------------------------|--------------------------|----------------------------|
//! | `bytes`                   | `output_size` rule       | raw bytes                  |
//! | `i8` `u8`                 | 1                        | little-endian scalar       |
//! | `i16` `u16`               | 2                        | little-endian scalar       |
//! | `i32` `u32` `f32`         | 4                        | little-endian scalar       |
//! | `f64`                     | 8                        | little-endian scalar       |
//! | `u32[]` / `Uint32Array`.. | `output_size`, required  | elements over bytes written|
//!
//! ## Memory Growth
//!
//! `alloc_bytes` may grow memory. Growing replaces the backing buffer, so a
//! view taken before a call is never trusted after it: the marshaller
//! re-fetches the view before copying input and again before reading
//! output.

pub mod abi;
pub mod alloc;
pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod error;
pub mod function;
pub mod loader;
pub mod marshal;
pub mod registry;
pub mod stream;

pub use abi::*;
pub use alloc::*;
pub use bootstrap::*;
pub use codec::*;
pub use config::*;
pub use error::*;
pub use function::*;
pub use loader::*;
pub use marshal::*;
pub use registry::*;
pub use stream::*;
