//! simdbridge - host-side bridge for dual-variant WASM modules
//!
//! A module is shipped twice: once built with `simd128` and once as a
//! baseline build. This crate picks the variant the host can run, keeps the
//! live instance in a registry, and marshals byte buffers across the
//! `(in_ptr, in_len, out_ptr, out_cap) -> i32` calling convention.
//!
//! Host support:
//! - Browser (wasm32-unknown-unknown): JS `WebAssembly` API, `fetch` for bytes
//! - Native: in-process [`platform::native::NativeModule`] implementing the
//!   same ABI, used for embedding Rust transforms and for testing

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

pub mod bridge;
pub mod platform;

pub use bridge::{
    Backend, Bridge, BridgeConfig, BridgeError, BridgeResult, Bootstrapper, ChunkTransform,
    FunctionDescriptor, InitMode, InitOptions, InstanceRegistry, Marshaller, OutputSize,
    ReturnKind, Segmentation, Value, Variant,
};

/// Initialize panic hook for better error messages in browser console
#[cfg(target_arch = "wasm32")]
fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// WASM entry point.
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn main() {
    init_panic_hook();
}

/// Console logging helper
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    fn log(s: &str);
}

/// Log to browser console (WASM)
#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        $crate::log(&format!($($t)*))
    };
}

/// Log to stderr (native)
#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        eprintln!($($t)*)
    };
}
