//! Instance registry
//!
//! Holds the single active module handle and a cached view of its linear
//! memory. Linear memory can grow between calls; growing replaces the
//! backing buffer, so a cached view is checked for liveness and rebuilt
//! before it is handed out.

use super::abi::{TransformArgs, Variant};
use super::error::{BridgeError, BridgeResult};
use crate::console_log;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// One backing buffer of a module's linear memory.
///
/// A region stays valid until the memory grows; after that `is_live`
/// returns false and the region must not be used.
pub trait MemoryRegion {
    /// Size of the region in bytes
    fn byte_len(&self) -> usize;

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    /// Callers check bounds first.
    fn read(&self, offset: usize, dst: &mut [u8]);

    /// Copy `src` into the region at `offset`. Callers check bounds first.
    fn write(&self, offset: usize, src: &[u8]);

    /// Whether this is still the module's current backing buffer
    fn is_live(&self) -> bool;
}

/// An instantiated module exposing the bridge ABI.
pub trait ModuleHandle {
    /// The current backing region of the exported memory
    fn memory(&self) -> BridgeResult<Rc<dyn MemoryRegion>>;

    /// `alloc_bytes(len) -> ptr`; 0 means the allocator failed
    fn alloc(&self, len: u32) -> BridgeResult<u32>;

    /// `free_bytes(ptr, len)`
    fn free(&self, ptr: u32, len: u32) -> BridgeResult<()>;

    /// Call a transform export
    fn call(&self, export: &str, args: TransformArgs) -> BridgeResult<i32>;

    /// Names of all exports
    fn export_names(&self) -> Vec<String>;

    fn has_export(&self, name: &str) -> bool {
        self.export_names().iter().any(|n| n == name)
    }

    /// Value of the optional `version` export
    fn version(&self) -> Option<u32> {
        None
    }
}

/// Read/write window over a module's linear memory.
///
/// All accesses are bounds-checked against the region size.
#[derive(Clone)]
pub struct ByteView {
    region: Rc<dyn MemoryRegion>,
}

impl ByteView {
    pub fn new(region: Rc<dyn MemoryRegion>) -> Self {
        Self { region }
    }

    /// Size of the viewed memory in bytes
    pub fn len(&self) -> usize {
        self.region.byte_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the underlying region is still current
    pub fn is_live(&self) -> bool {
        self.region.is_live()
    }

    /// Whether two views share the same backing region
    pub fn same_region(&self, other: &ByteView) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.region), Rc::as_ptr(&other.region))
    }

    /// Read `len` bytes at `ptr`
    pub fn read(&self, ptr: u32, len: u32) -> BridgeResult<Vec<u8>> {
        self.check_bounds(ptr, len)?;
        let mut out = vec![0u8; len as usize];
        self.region.read(ptr as usize, &mut out);
        Ok(out)
    }

    /// Write `data` at `ptr`
    pub fn write(&self, ptr: u32, data: &[u8]) -> BridgeResult<()> {
        let len = u32::try_from(data.len()).map_err(|_| BridgeError::TypeError {
            reason: format!("{} bytes exceed the 32-bit address space", data.len()),
        })?;
        self.check_bounds(ptr, len)?;
        self.region.write(ptr as usize, data);
        Ok(())
    }

    fn check_bounds(&self, ptr: u32, len: u32) -> BridgeResult<()> {
        let size = self.len();
        let end = ptr as u64 + len as u64;
        if !self.is_live() || end > size as u64 {
            return Err(BridgeError::MemoryAccessOutOfBounds {
                address: ptr,
                size: len,
                memory_size: size as u32,
            });
        }
        Ok(())
    }
}

struct Active {
    handle: Rc<dyn ModuleHandle>,
    variant: Option<Variant>,
    view: ByteView,
}

thread_local! {
    /// The process-wide registry
    static GLOBAL: Rc<InstanceRegistry> = Rc::new(InstanceRegistry::new());
}

/// Holder of the active module handle and its memory view
pub struct InstanceRegistry {
    active: RefCell<Option<Active>>,
    /// Bumped on every replacement; buffers from an older generation
    /// belong to a module that is gone.
    generation: Cell<u64>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            active: RefCell::new(None),
            generation: Cell::new(0),
        }
    }

    /// The process-wide registry used by the browser surface
    pub fn global() -> Rc<InstanceRegistry> {
        GLOBAL.with(Rc::clone)
    }

    /// Replace the active handle and recompute the memory view.
    ///
    /// `variant` is `None` for modules set directly by an embedder.
    pub fn set_instance(
        &self,
        handle: Rc<dyn ModuleHandle>,
        variant: Option<Variant>,
    ) -> BridgeResult<()> {
        let view = ByteView::new(handle.memory()?);
        let previous = self.active.borrow_mut().replace(Active {
            handle,
            variant,
            view,
        });
        self.generation.set(self.generation.get() + 1);

        if let Some(previous) = previous {
            console_log!(
                "[registry] replaced active module ({})",
                previous.variant.map_or("custom", |v| v.as_str())
            );
        }
        Ok(())
    }

    /// Current memory view, rebuilt first if memory grew since it was taken
    pub fn memory_view(&self) -> BridgeResult<ByteView> {
        let mut active = self.active.borrow_mut();
        let active = active.as_mut().ok_or(BridgeError::NotInitialized)?;
        if !active.view.is_live() {
            active.view = ByteView::new(active.handle.memory()?);
        }
        Ok(active.view.clone())
    }

    /// The active module's full export table
    pub fn raw_exports(&self) -> BridgeResult<Rc<dyn ModuleHandle>> {
        self.active
            .borrow()
            .as_ref()
            .map(|a| Rc::clone(&a.handle))
            .ok_or(BridgeError::NotInitialized)
    }

    /// Variant of the active module, if it came from the bootstrapper
    pub fn active_variant(&self) -> Option<Variant> {
        self.active.borrow().as_ref().and_then(|a| a.variant)
    }

    pub fn is_initialized(&self) -> bool {
        self.active.borrow().is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    /// Drop the active handle and its view
    pub fn invalidate(&self) {
        if self.active.borrow_mut().take().is_some() {
            self.generation.set(self.generation.get() + 1);
        }
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::native::NativeModule;

    fn module() -> Rc<NativeModule> {
        Rc::new(NativeModule::builder().version(7).build())
    }

    #[test]
    fn test_uninitialized_registry() {
        let registry = InstanceRegistry::new();
        assert!(!registry.is_initialized());
        assert!(matches!(
            registry.memory_view(),
            Err(BridgeError::NotInitialized)
        ));
        assert!(matches!(
            registry.raw_exports(),
            Err(BridgeError::NotInitialized)
        ));
    }

    #[test]
    fn test_set_instance() {
        let registry = InstanceRegistry::new();
        registry
            .set_instance(module(), Some(Variant::Base))
            .unwrap();
        assert!(registry.is_initialized());
        assert_eq!(registry.active_variant(), Some(Variant::Base));
        assert_eq!(registry.raw_exports().unwrap().version(), Some(7));
        assert_eq!(registry.generation(), 1);
    }

    #[test]
    fn test_view_is_cached_while_live() {
        let registry = InstanceRegistry::new();
        registry.set_instance(module(), None).unwrap();
        let a = registry.memory_view().unwrap();
        let b = registry.memory_view().unwrap();
        assert!(a.same_region(&b));
    }

    #[test]
    fn test_view_refreshed_after_growth() {
        let registry = InstanceRegistry::new();
        let native = module();
        registry.set_instance(native.clone(), None).unwrap();
        let before = registry.memory_view().unwrap();

        native.grow(1).unwrap();

        assert!(!before.is_live());
        let after = registry.memory_view().unwrap();
        assert!(after.is_live());
        assert!(!after.same_region(&before));
        assert!(after.len() > before.len() || before.is_empty());
    }

    #[test]
    fn test_view_bounds() {
        let registry = InstanceRegistry::new();
        registry.set_instance(module(), None).unwrap();
        let view = registry.memory_view().unwrap();
        let size = view.len() as u32;

        view.write(16, b"abc").unwrap();
        assert_eq!(view.read(16, 3).unwrap(), b"abc");
        assert!(matches!(
            view.read(size - 2, 4),
            Err(BridgeError::MemoryAccessOutOfBounds { .. })
        ));
        assert!(matches!(
            view.write(u32::MAX, b"x"),
            Err(BridgeError::MemoryAccessOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_invalidate() {
        let registry = InstanceRegistry::new();
        registry.set_instance(module(), None).unwrap();
        registry.invalidate();
        assert!(!registry.is_initialized());
        assert_eq!(registry.generation(), 2);
    }
}
