//! Call marshaller
//!
//! Copies input bytes into module memory, calls a transform export with
//! `(in_ptr, in_len, out_ptr, out_cap)`, checks the signed result and copies
//! the written output back out.
//!
//! Memory may grow during any allocation or foreign call, so the view is
//! re-fetched right before the input copy and right before the output read.

use super::abi::{self, TransformArgs};
use super::alloc::{Allocator, BufferHandle, ReuseSlot};
use super::error::{BridgeError, BridgeResult};
use super::registry::{InstanceRegistry, ModuleHandle};
use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// Output capacity used when a bytes-returning function declares none
const MIN_DEFAULT_OUTPUT: u64 = 4;

/// Rule for sizing the output buffer from the input length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSize {
    /// `max(input_len, 4)`
    #[default]
    Default,
    /// Always `n` bytes
    Fixed(u32),
    /// `ceil(input_len * mul / div) + add`
    Scaled {
        mul: u32,
        #[serde(default = "one")]
        div: u32,
        #[serde(default)]
        add: u32,
    },
}

fn one() -> u32 {
    1
}

impl OutputSize {
    /// Same size as the input
    pub const SAME: OutputSize = OutputSize::Scaled {
        mul: 1,
        div: 1,
        add: 0,
    };

    /// Output capacity for an input of `input_len` bytes
    pub fn capacity_for(&self, input_len: usize) -> BridgeResult<u32> {
        let len = input_len as u64;
        let capacity = match *self {
            OutputSize::Default => len.max(MIN_DEFAULT_OUTPUT),
            OutputSize::Fixed(n) => n as u64,
            OutputSize::Scaled { div: 0, .. } => {
                return Err(BridgeError::InvalidConfig {
                    reason: "output size divisor is zero".to_string(),
                });
            }
            OutputSize::Scaled { mul, div, add } => {
                (len * mul as u64).div_ceil(div as u64) + add as u64
            }
        };
        u32::try_from(capacity).map_err(|_| BridgeError::OutOfMemory {
            requested: u32::MAX,
        })
    }
}

/// Result of one marshalled call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutput {
    /// Where the module wrote its output
    pub out_ptr: u32,
    /// Bytes written
    pub written: u32,
    /// Copy of the written region
    pub bytes: Vec<u8>,
}

/// Generic caller for transform exports of the active module
#[derive(Clone)]
pub struct Marshaller {
    registry: Rc<InstanceRegistry>,
}

impl Marshaller {
    pub fn new(registry: Rc<InstanceRegistry>) -> Self {
        Self { registry }
    }

    /// Marshaller over the process-wide registry
    pub fn global() -> Self {
        Self::new(InstanceRegistry::global())
    }

    pub fn registry(&self) -> &Rc<InstanceRegistry> {
        &self.registry
    }

    /// Call `export` with `input`, giving it `output_capacity` bytes to
    /// write into.
    ///
    /// Without a slot, both buffers are allocated for this call and
    /// released before returning, on success and on failure. With a slot,
    /// the slot's buffers are grown as needed and kept.
    pub fn invoke(
        &self,
        export: &str,
        input: &[u8],
        output_capacity: u32,
        slot: Option<&mut ReuseSlot>,
    ) -> BridgeResult<CallOutput> {
        let module = self.registry.raw_exports()?;
        let in_len = u32::try_from(input.len()).map_err(|_| BridgeError::TypeError {
            reason: format!("{} input bytes exceed the 32-bit address space", input.len()),
        })?;
        let alloc = Allocator::new(Rc::clone(&module), self.registry.generation());

        match slot {
            Some(slot) => {
                let (in_buf, out_buf) = slot.prepare(&alloc, in_len, output_capacity)?;
                self.run(&*module, export, input, in_buf, out_buf, output_capacity)
            }
            None => {
                let in_buf = alloc.transient(in_len)?;
                let out_buf = alloc.transient(output_capacity)?;
                self.run(
                    &*module,
                    export,
                    input,
                    in_buf.handle(),
                    out_buf.handle(),
                    output_capacity,
                )
            }
        }
    }

    /// [`Marshaller::invoke`] with a typed slice as input
    pub fn invoke_typed<T: Pod>(
        &self,
        export: &str,
        input: &[T],
        output_capacity: u32,
        slot: Option<&mut ReuseSlot>,
    ) -> BridgeResult<CallOutput> {
        self.invoke(export, bytemuck::cast_slice(input), output_capacity, slot)
    }

    fn run(
        &self,
        module: &dyn ModuleHandle,
        export: &str,
        input: &[u8],
        in_buf: BufferHandle,
        out_buf: BufferHandle,
        out_cap: u32,
    ) -> BridgeResult<CallOutput> {
        self.registry.memory_view()?.write(in_buf.ptr, input)?;

        let args = TransformArgs {
            in_ptr: in_buf.ptr,
            in_len: input.len() as u32,
            out_ptr: out_buf.ptr,
            out_cap,
        };
        let ret = module.call(export, args)?;
        let written =
            abi::interpret_return(ret).map_err(|code| BridgeError::ForeignCallFailed {
                export: export.to_string(),
                code,
            })?;
        if written > out_cap {
            return Err(BridgeError::MalformedOutput {
                reason: format!(
                    "'{}' reported {} bytes written into a {} byte buffer",
                    export, written, out_cap
                ),
            });
        }

        let bytes = self.registry.memory_view()?.read(out_buf.ptr, written)?;
        Ok(CallOutput {
            out_ptr: out_buf.ptr,
            written,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::native::NativeModule;

    fn setup(module: NativeModule) -> (Rc<NativeModule>, Marshaller) {
        let module = Rc::new(module);
        let registry = Rc::new(InstanceRegistry::new());
        registry.set_instance(module.clone(), None).unwrap();
        (module, Marshaller::new(registry))
    }

    fn add_one() -> NativeModule {
        NativeModule::builder()
            .transform("add_one", |input, out| {
                if out.len() < input.len() {
                    return -2;
                }
                for (o, i) in out.iter_mut().zip(input) {
                    *o = i.wrapping_add(1);
                }
                input.len() as i32
            })
            .transform("fail", |_, _| -1)
            .transform("liar", |_, out| out.len() as i32 + 1)
            .build()
    }

    #[test]
    fn test_output_size_rules() {
        assert_eq!(OutputSize::Default.capacity_for(0).unwrap(), 4);
        assert_eq!(OutputSize::Default.capacity_for(100).unwrap(), 100);
        assert_eq!(OutputSize::Fixed(16).capacity_for(100).unwrap(), 16);
        assert_eq!(OutputSize::SAME.capacity_for(7).unwrap(), 7);
        let base64 = OutputSize::Scaled {
            mul: 4,
            div: 3,
            add: 4,
        };
        assert_eq!(base64.capacity_for(10).unwrap(), 18);
        let zero = OutputSize::Scaled {
            mul: 1,
            div: 0,
            add: 0,
        };
        assert!(matches!(
            zero.capacity_for(1),
            Err(BridgeError::InvalidConfig { .. })
        ));
        let huge = OutputSize::Scaled {
            mul: u32::MAX,
            div: 1,
            add: 0,
        };
        assert!(huge.capacity_for(16).is_err());
    }

    #[test]
    fn test_output_size_serde() {
        let size: OutputSize = serde_json::from_str(r#"{"scaled":{"mul":2}}"#).unwrap();
        assert_eq!(
            size,
            OutputSize::Scaled {
                mul: 2,
                div: 1,
                add: 0
            }
        );
        let size: OutputSize = serde_json::from_str(r#"{"fixed":8}"#).unwrap();
        assert_eq!(size, OutputSize::Fixed(8));
        let size: OutputSize = serde_json::from_str(r#""default""#).unwrap();
        assert_eq!(size, OutputSize::Default);
    }

    #[test]
    fn test_invoke_transient() {
        let (module, marshaller) = setup(add_one());
        let out = marshaller.invoke("add_one", b"hello", 5, None).unwrap();
        assert_eq!(out.bytes, b"ifmmp");
        assert_eq!(out.written, 5);

        let stats = module.stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.frees, 2);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn test_invoke_empty_input() {
        let (_module, marshaller) = setup(add_one());
        let out = marshaller.invoke("add_one", b"", 4, None).unwrap();
        assert!(out.bytes.is_empty());
    }

    #[test]
    fn test_negative_return_frees_transients() {
        let (module, marshaller) = setup(add_one());
        let err = marshaller.invoke("fail", b"abc", 4, None).unwrap_err();
        assert_eq!(err.foreign_code(), Some(1));
        let stats = module.stats();
        assert_eq!(stats.allocations, stats.frees);
    }

    #[test]
    fn test_written_past_capacity() {
        let (module, marshaller) = setup(add_one());
        let err = marshaller.invoke("liar", b"abc", 4, None).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedOutput { .. }));
        assert_eq!(module.stats().live, 0);
    }

    #[test]
    fn test_missing_export_frees_transients() {
        let (module, marshaller) = setup(add_one());
        let err = marshaller.invoke("nope", b"abc", 4, None).unwrap_err();
        assert!(matches!(err, BridgeError::MissingExport { .. }));
        assert_eq!(module.stats().live, 0);
    }

    #[test]
    fn test_not_initialized() {
        let marshaller = Marshaller::new(Rc::new(InstanceRegistry::new()));
        assert_eq!(
            marshaller.invoke("add_one", b"x", 4, None).unwrap_err(),
            BridgeError::NotInitialized
        );
    }

    #[test]
    fn test_invoke_with_slot_keeps_buffers() {
        let (module, marshaller) = setup(add_one());
        let mut slot = ReuseSlot::new();

        marshaller
            .invoke("add_one", b"abcd", 4, Some(&mut slot))
            .unwrap();
        let err = marshaller
            .invoke("fail", b"ab", 4, Some(&mut slot))
            .unwrap_err();
        assert_eq!(err.foreign_code(), Some(1));

        let stats = module.stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.frees, 0);
        assert_eq!(stats.live, 2);
    }

    #[test]
    fn test_invoke_typed() {
        let module = NativeModule::builder()
            .transform("sum_u16", |input, out| {
                if input.len() % 2 != 0 || out.len() < 4 {
                    return -1;
                }
                let sum: u32 = input
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
                    .sum();
                out[..4].copy_from_slice(&sum.to_le_bytes());
                4
            })
            .build();
        let (_module, marshaller) = setup(module);
        let out = marshaller
            .invoke_typed("sum_u16", &[1u16, 2, 300], 4, None)
            .unwrap();
        assert_eq!(out.bytes, 303u32.to_le_bytes());
    }

    #[test]
    fn test_growth_during_allocation() {
        let module = add_one();
        module.grow_on_allocation(2);
        let (module, marshaller) = setup(module);

        let out = marshaller.invoke("add_one", b"xyz", 3, None).unwrap();
        assert_eq!(out.bytes, b"yz{");
        assert_eq!(module.stats().grows, 1);
    }
}
