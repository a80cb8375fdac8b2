//! Host platforms
//!
//! The bridge core only talks to [`ModuleHandle`](crate::bridge::ModuleHandle)
//! and [`MemoryRegion`](crate::bridge::MemoryRegion). Each host provides
//! those for its kind of module:
//!
//! - Browser (wasm-bindgen, js-sys): `WebAssembly.Instance` and its memory
//! - Native: [`native::NativeModule`], an in-process module with the same ABI

pub mod native;

#[cfg(target_arch = "wasm32")]
#[cfg(target_os = "unknown")] // Browser WASM (no WASI)
pub mod web;
