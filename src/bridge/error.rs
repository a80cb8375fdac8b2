//! Error types for the bridge
//!
//! Every failure a caller can see, from loading a variant's bytes down to a
//! transform returning a negative code.

use super::abi::Variant;
use std::fmt;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while loading, instantiating or calling a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Raw bytes for a variant could not be read or fetched
    SourceUnavailable {
        variant: Variant,
        reason: String,
    },

    /// Binary failed to compile or instantiate against the imports
    InstantiationFailed {
        variant: Variant,
        reason: String,
    },

    /// A call was made before any module was published
    NotInitialized,

    /// Transform returned a negative value; `code` is its magnitude
    ForeignCallFailed {
        export: String,
        code: u32,
    },

    /// Foreign code trapped or threw instead of returning
    ForeignTrap {
        export: String,
        reason: String,
    },

    /// Declared return kind is not one the codec knows
    UnsupportedReturnType {
        kind: String,
    },

    /// Input value could not be turned into bytes
    TypeError {
        reason: String,
    },

    /// Required export is missing
    MissingExport {
        name: String,
    },

    /// Export has wrong type
    WrongExportType {
        name: String,
        expected: &'static str,
    },

    /// Memory access out of bounds
    MemoryAccessOutOfBounds {
        address: u32,
        size: u32,
        memory_size: u32,
    },

    /// The module's allocator could not satisfy a request
    OutOfMemory {
        requested: u32,
    },

    /// Output region does not match what the return kind needs
    MalformedOutput {
        reason: String,
    },

    /// Function descriptor is inconsistent
    InvalidDescriptor {
        name: String,
        reason: String,
    },

    /// No wrapped function with this local name
    UnknownFunction {
        name: String,
    },

    /// Stream was aborted by an earlier failure
    StreamAborted,

    /// Configuration could not be parsed or validated
    InvalidConfig {
        reason: String,
    },
}

impl BridgeError {
    /// Foreign error code, if this is a failed transform call
    pub fn foreign_code(&self) -> Option<u32> {
        match self {
            Self::ForeignCallFailed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Short variant name, used as the JS error name
    pub fn name(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "SourceUnavailable",
            Self::InstantiationFailed { .. } => "InstantiationError",
            Self::NotInitialized => "NotInitialized",
            Self::ForeignCallFailed { .. } => "ForeignCallFailed",
            Self::ForeignTrap { .. } => "ForeignTrap",
            Self::UnsupportedReturnType { .. } => "UnsupportedReturnType",
            Self::TypeError { .. } => "TypeError",
            Self::MissingExport { .. } => "MissingExport",
            Self::WrongExportType { .. } => "WrongExportType",
            Self::MemoryAccessOutOfBounds { .. } => "MemoryAccessOutOfBounds",
            Self::OutOfMemory { .. } => "OutOfMemory",
            Self::MalformedOutput { .. } => "MalformedOutput",
            Self::InvalidDescriptor { .. } => "InvalidDescriptor",
            Self::UnknownFunction { .. } => "UnknownFunction",
            Self::StreamAborted => "StreamAborted",
            Self::InvalidConfig { .. } => "InvalidConfig",
        }
    }

    /// Whether this failure happened while obtaining a module
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. } | Self::InstantiationFailed { .. }
        )
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceUnavailable { variant, reason } => {
                write!(f, "{} variant unavailable: {}", variant, reason)
            }
            Self::InstantiationFailed { variant, reason } => {
                write!(f, "{} variant failed to instantiate: {}", variant, reason)
            }
            Self::NotInitialized => {
                write!(f, "module not initialized")
            }
            Self::ForeignCallFailed { export, code } => {
                write!(f, "'{}' failed with code {}", export, code)
            }
            Self::ForeignTrap { export, reason } => {
                write!(f, "'{}' trapped: {}", export, reason)
            }
            Self::UnsupportedReturnType { kind } => {
                write!(f, "unsupported return type: '{}'", kind)
            }
            Self::TypeError { reason } => {
                write!(f, "type error: {}", reason)
            }
            Self::MissingExport { name } => {
                write!(f, "missing required export: '{}'", name)
            }
            Self::WrongExportType { name, expected } => {
                write!(f, "export '{}' has wrong type: expected {}", name, expected)
            }
            Self::MemoryAccessOutOfBounds {
                address,
                size,
                memory_size,
            } => {
                write!(
                    f,
                    "memory access out of bounds: address {} + size {} > memory size {}",
                    address, size, memory_size
                )
            }
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: could not allocate {} bytes", requested)
            }
            Self::MalformedOutput { reason } => {
                write!(f, "malformed output: {}", reason)
            }
            Self::InvalidDescriptor { name, reason } => {
                write!(f, "invalid descriptor '{}': {}", name, reason)
            }
            Self::UnknownFunction { name } => {
                write!(f, "unknown function: {}", name)
            }
            Self::StreamAborted => {
                write!(f, "stream aborted by an earlier failure")
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid configuration: {}", reason)
            }
        }
    }
}

impl std::error::Error for BridgeError {}
