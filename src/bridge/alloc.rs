//! Allocation bridge
//!
//! All foreign buffer lifetimes go through here. The host never owns
//! module memory; it holds `(ptr, len)` pairs and asks the module's own
//! allocator for them.
//!
//! Two ownership flavors:
//! - [`TransientBuffer`]: lives for one call, released on drop on every path
//! - [`ReuseSlot`]: owned by one wrapped function, grown on demand

use super::error::{BridgeError, BridgeResult};
use super::registry::{InstanceRegistry, ModuleHandle};
use crate::console_log;
use std::rc::Rc;

/// A region inside linear memory.
///
/// `len` is the allocated capacity, the exact value to pass back to
/// `free_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    pub ptr: u32,
    pub len: u32,
}

impl BufferHandle {
    pub const fn new(ptr: u32, len: u32) -> Self {
        Self { ptr, len }
    }

    /// End offset (ptr + len)
    pub const fn end(&self) -> u64 {
        self.ptr as u64 + self.len as u64
    }
}

/// Thin wrapper over a module's `alloc_bytes` / `free_bytes`
#[derive(Clone)]
pub struct Allocator {
    module: Rc<dyn ModuleHandle>,
    generation: u64,
}

impl Allocator {
    pub fn new(module: Rc<dyn ModuleHandle>, generation: u64) -> Self {
        Self { module, generation }
    }

    /// Allocator for the registry's active module
    pub fn from_registry(registry: &InstanceRegistry) -> BridgeResult<Self> {
        Ok(Self::new(registry.raw_exports()?, registry.generation()))
    }

    /// Registry generation of the module this allocator talks to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Allocate `len` bytes.
    ///
    /// Zero-length requests allocate one byte so the foreign allocator
    /// never sees a zero-sized layout.
    pub fn allocate(&self, len: u32) -> BridgeResult<BufferHandle> {
        let size = len.max(1);
        let ptr = self.module.alloc(size)?;
        if ptr == 0 {
            return Err(BridgeError::OutOfMemory { requested: size });
        }
        Ok(BufferHandle::new(ptr, size))
    }

    /// Release a buffer returned by [`Allocator::allocate`].
    ///
    /// The pair must match the allocation exactly; the module does not
    /// validate it.
    pub fn release(&self, buf: BufferHandle) -> BridgeResult<()> {
        self.module.free(buf.ptr, buf.len)
    }

    /// Allocate a buffer that is released when the guard drops
    pub fn transient(&self, len: u32) -> BridgeResult<TransientBuffer> {
        let buf = self.allocate(len)?;
        Ok(TransientBuffer {
            module: Rc::clone(&self.module),
            buf,
        })
    }
}

/// Buffer scoped to a single call
pub struct TransientBuffer {
    module: Rc<dyn ModuleHandle>,
    buf: BufferHandle,
}

impl TransientBuffer {
    pub fn handle(&self) -> BufferHandle {
        self.buf
    }
}

impl Drop for TransientBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.module.free(self.buf.ptr, self.buf.len) {
            console_log!("[alloc] release of {:?} failed: {}", self.buf, e);
        }
    }
}

/// Persistent input/output buffer pair owned by one wrapped function.
///
/// Grows (allocate new, free old) when a call needs more room, never
/// shrinks. Buffers recorded for an older registry generation belonged to
/// a replaced module and are forgotten rather than freed.
#[derive(Debug, Default)]
pub struct ReuseSlot {
    input: Option<BufferHandle>,
    output: Option<BufferHandle>,
    generation: u64,
    allocations: u32,
}

impl ReuseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_capacity(&self) -> u32 {
        self.input.map_or(0, |b| b.len)
    }

    pub fn output_capacity(&self) -> u32 {
        self.output.map_or(0, |b| b.len)
    }

    /// Number of (re)allocations performed by this slot
    pub fn allocations(&self) -> u32 {
        self.allocations
    }

    /// Buffers large enough for `in_len` input bytes and `out_cap` output bytes
    pub fn prepare(
        &mut self,
        alloc: &Allocator,
        in_len: u32,
        out_cap: u32,
    ) -> BridgeResult<(BufferHandle, BufferHandle)> {
        if self.generation != alloc.generation() {
            self.input = None;
            self.output = None;
            self.generation = alloc.generation();
        }

        let input = self.ensure_input(alloc, in_len)?;
        let output = self.ensure_output(alloc, out_cap)?;
        Ok((input, output))
    }

    fn ensure_input(&mut self, alloc: &Allocator, needed: u32) -> BridgeResult<BufferHandle> {
        let (buf, grown) = Self::ensure(&mut self.input, alloc, needed)?;
        self.allocations += grown as u32;
        Ok(buf)
    }

    fn ensure_output(&mut self, alloc: &Allocator, needed: u32) -> BridgeResult<BufferHandle> {
        let (buf, grown) = Self::ensure(&mut self.output, alloc, needed)?;
        self.allocations += grown as u32;
        Ok(buf)
    }

    fn ensure(
        slot: &mut Option<BufferHandle>,
        alloc: &Allocator,
        needed: u32,
    ) -> BridgeResult<(BufferHandle, bool)> {
        if let Some(buf) = *slot {
            if buf.len >= needed.max(1) {
                return Ok((buf, false));
            }
        }

        let fresh = alloc.allocate(needed)?;
        if let Some(old) = slot.replace(fresh) {
            alloc.release(old)?;
        }
        Ok((fresh, true))
    }

    /// Release both buffers.
    ///
    /// Buffers from a replaced module are dropped without a foreign call.
    pub fn teardown(&mut self, alloc: &Allocator) -> BridgeResult<()> {
        let input = self.input.take();
        let output = self.output.take();
        if self.generation != alloc.generation() {
            return Ok(());
        }
        for buf in [input, output].into_iter().flatten() {
            alloc.release(buf)?;
        }
        Ok(())
    }
}
