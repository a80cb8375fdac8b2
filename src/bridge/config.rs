//! Bridge configuration
//!
//! A bridge is described by JSON: the module name, the backend policy, the
//! initialization mode, and the table of wrapped functions.
//!
//! ```json
//! {
//!   "name": "lines",
//!   "backend": "auto",
//!   "init": "lazy",
//!   "functions": [
//!     { "export": "split_lines_chunk", "output_size": { "scaled": { "mul": 1 } }, "reuse": true },
//!     { "export": "sum_u16_bytes", "name": "sum", "returns": "f32" },
//!     { "export": "find_line_offsets", "returns": "u32[]", "output_size": { "scaled": { "mul": 4 } } }
//!   ]
//! }
//! ```

use super::bootstrap::{Backend, InitOptions};
use super::error::{BridgeError, BridgeResult};
use super::function::FunctionDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// When the module is instantiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitMode {
    /// The host calls `initialize` before any call; calls are synchronous
    #[default]
    Eager,
    /// Every call first awaits the shared initialization
    Lazy,
}

/// Declarative description of one bridged module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Module name; variant files are `<name>_simd.wasm` / `<name>_base.wasm`
    pub name: String,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub init: InitMode,
    #[serde(default)]
    pub functions: Vec<FunctionDescriptor>,
}

impl BridgeConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            backend: Backend::default(),
            init: InitMode::default(),
            functions: Vec::new(),
        }
    }

    pub fn function(mut self, descriptor: FunctionDescriptor) -> Self {
        self.functions.push(descriptor);
        self
    }

    /// Parse and validate
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        let config: BridgeConfig =
            serde_json::from_str(json).map_err(|e| BridgeError::InvalidConfig {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn from_file(path: impl AsRef<std::path::Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| BridgeError::InvalidConfig {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> BridgeResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| BridgeError::InvalidConfig {
            reason: e.to_string(),
        })
    }

    pub fn init_options(&self) -> InitOptions {
        InitOptions::backend(self.backend)
    }

    /// Check the module name and every descriptor; local names must be
    /// unique
    pub fn validate(&self) -> BridgeResult<()> {
        if self.name.trim().is_empty() {
            return Err(BridgeError::InvalidConfig {
                reason: "module name is empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for descriptor in &self.functions {
            descriptor.validate()?;
            if !seen.insert(descriptor.local_name()) {
                return Err(BridgeError::InvalidConfig {
                    reason: format!("duplicate function name '{}'", descriptor.local_name()),
                });
            }
        }
        Ok(())
    }
}
