//! Native host
//!
//! [`NativeModule`] is an in-process module that honours the bridge ABI
//! without a WASM engine: a growable linear memory, a first-fit allocator
//! behind `alloc_bytes`/`free_bytes`, and transform exports implemented as
//! Rust closures. Growing memory swaps in a new backing region and detaches
//! the old one, the same way a JS `ArrayBuffer` is detached by
//! `memory.grow`.
//!
//! Every call is counted, which makes the module usable as a test double
//! for the allocation and instantiation contracts.

use crate::bridge::abi::{PAGE_SIZE, TransformArgs, Variant, exports};
use crate::bridge::bootstrap::Instantiator;
use crate::bridge::error::{BridgeError, BridgeResult};
use crate::bridge::loader::ModuleValidator;
use crate::bridge::registry::{MemoryRegion, ModuleHandle};
use futures::future::LocalBoxFuture;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// Addresses below this are never handed out; 0 is the null pointer.
const HEAP_BASE: u32 = 1024;

/// Allocation granularity
const ALIGN: u32 = 8;

/// Default maximum memory pages (64 KB per page)
const DEFAULT_MAX_PAGES: u32 = 16384; // 1 GB

/// A transform export: reads the input, fills the output buffer
/// (`out_cap` bytes), returns bytes written or a negative error code.
pub type NativeTransform = Rc<dyn Fn(&[u8], &mut [u8]) -> i32>;

/// One backing buffer of native linear memory
struct NativeRegion {
    bytes: RefCell<Vec<u8>>,
    live: Cell<bool>,
}

impl MemoryRegion for NativeRegion {
    fn byte_len(&self) -> usize {
        // A detached buffer reports zero length
        if self.live.get() {
            self.bytes.borrow().len()
        } else {
            0
        }
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        let bytes = self.bytes.borrow();
        if let Some(src) = bytes.get(offset..offset + dst.len()) {
            dst.copy_from_slice(src);
        }
    }

    fn write(&self, offset: usize, src: &[u8]) {
        let mut bytes = self.bytes.borrow_mut();
        if let Some(dst) = bytes.get_mut(offset..offset + src.len()) {
            dst.copy_from_slice(src);
        }
    }

    fn is_live(&self) -> bool {
        self.live.get()
    }
}

/// Call counters of a native module
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeStats {
    /// `alloc_bytes` calls
    pub allocations: u32,
    /// `free_bytes` calls
    pub frees: u32,
    /// Transform calls
    pub calls: u32,
    /// Memory growths
    pub grows: u32,
    /// Allocations not yet freed
    pub live: usize,
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    requested: u32,
    reserved: u32,
}

/// First-fit allocator over the heap part of linear memory
#[derive(Debug)]
struct Heap {
    top: u32,
    free: Vec<(u32, u32)>,
    live: BTreeMap<u32, Allocation>,
}

impl Heap {
    fn new() -> Self {
        Self {
            top: HEAP_BASE,
            free: Vec::new(),
            live: BTreeMap::new(),
        }
    }

    fn take_free(&mut self, size: u32) -> Option<u32> {
        let idx = self.free.iter().position(|&(_, len)| len >= size)?;
        let (ptr, len) = self.free.remove(idx);
        if len > size {
            self.free.push((ptr + size, len - size));
            self.free.sort_unstable();
        }
        Some(ptr)
    }

    fn give_back(&mut self, ptr: u32, len: u32) {
        self.free.push((ptr, len));
        self.free.sort_unstable();

        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.free.len());
        for (ptr, len) in self.free.drain(..) {
            match merged.last_mut() {
                Some(last) if last.0 + last.1 == ptr => last.1 += len,
                _ => merged.push((ptr, len)),
            }
        }

        // A free block touching the top returns to the bump region
        if let Some(&(ptr, len)) = merged.last() {
            if ptr + len == self.top {
                self.top = ptr;
                merged.pop();
            }
        }
        self.free = merged;
    }
}

/// In-process module implementing the bridge ABI
pub struct NativeModule {
    region: RefCell<Rc<NativeRegion>>,
    max_pages: u32,
    heap: RefCell<Heap>,
    transforms: HashMap<String, NativeTransform>,
    version: Option<u32>,
    stats: Cell<NativeStats>,
    grow_on_allocation: Cell<Option<u32>>,
}

impl NativeModule {
    pub fn builder() -> NativeModuleBuilder {
        NativeModuleBuilder::new()
    }

    /// Call counters so far
    pub fn stats(&self) -> NativeStats {
        let mut stats = self.stats.get();
        stats.live = self.heap.borrow().live.len();
        stats
    }

    /// Current memory size in pages
    pub fn pages(&self) -> u32 {
        (self.region.borrow().bytes.borrow().len() / PAGE_SIZE) as u32
    }

    /// Grow memory by `pages`, detaching the current region
    pub fn grow(&self, pages: u32) -> BridgeResult<()> {
        let total = self.pages() as u64 + pages as u64;
        if total > self.max_pages as u64 {
            return Err(BridgeError::OutOfMemory {
                requested: pages.saturating_mul(PAGE_SIZE as u32),
            });
        }

        let old = Rc::clone(&self.region.borrow());
        let mut bytes = old.bytes.borrow().clone();
        bytes.resize(total as usize * PAGE_SIZE, 0);
        old.live.set(false);

        *self.region.borrow_mut() = Rc::new(NativeRegion {
            bytes: RefCell::new(bytes),
            live: Cell::new(true),
        });
        self.bump(|s| s.grows += 1);
        Ok(())
    }

    /// Grow memory by one page during the `n`th `alloc_bytes` call
    /// (counting from 1), whether or not the allocation needs it.
    pub fn grow_on_allocation(&self, n: u32) {
        self.grow_on_allocation.set(Some(n));
    }

    fn bump(&self, f: impl FnOnce(&mut NativeStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    fn memory_len(&self) -> u64 {
        self.region.borrow().bytes.borrow().len() as u64
    }

    fn trap(export: &str, reason: String) -> BridgeError {
        BridgeError::ForeignTrap {
            export: export.to_string(),
            reason,
        }
    }
}

impl ModuleHandle for NativeModule {
    fn memory(&self) -> BridgeResult<Rc<dyn MemoryRegion>> {
        let region: Rc<NativeRegion> = Rc::clone(&self.region.borrow());
        Ok(region)
    }

    fn alloc(&self, len: u32) -> BridgeResult<u32> {
        self.bump(|s| s.allocations += 1);
        if self.grow_on_allocation.get() == Some(self.stats.get().allocations) {
            self.grow(1)?;
        }

        let size = match len.max(1).checked_next_multiple_of(ALIGN) {
            Some(size) => size,
            None => return Ok(0),
        };

        let reused = self.heap.borrow_mut().take_free(size);
        let ptr = match reused {
            Some(ptr) => ptr,
            None => {
                let top = self.heap.borrow().top;
                let end = top as u64 + size as u64;
                let mem_len = self.memory_len();
                if end > mem_len {
                    let pages = (end - mem_len).div_ceil(PAGE_SIZE as u64);
                    if self.grow(pages as u32).is_err() {
                        return Ok(0);
                    }
                }
                self.heap.borrow_mut().top = end as u32;
                top
            }
        };

        self.heap.borrow_mut().live.insert(
            ptr,
            Allocation {
                requested: len,
                reserved: size,
            },
        );
        Ok(ptr)
    }

    fn free(&self, ptr: u32, len: u32) -> BridgeResult<()> {
        let mut heap = self.heap.borrow_mut();
        let allocation = match heap.live.get(&ptr) {
            Some(a) if a.requested == len => *a,
            Some(a) => {
                return Err(Self::trap(
                    exports::FREE,
                    format!(
                        "length mismatch at {}: allocated {}, freed {}",
                        ptr, a.requested, len
                    ),
                ));
            }
            None => {
                return Err(Self::trap(
                    exports::FREE,
                    format!("{} is not an allocated pointer", ptr),
                ));
            }
        };
        heap.live.remove(&ptr);
        heap.give_back(ptr, allocation.reserved);
        drop(heap);

        self.bump(|s| s.frees += 1);
        Ok(())
    }

    fn call(&self, export: &str, args: TransformArgs) -> BridgeResult<i32> {
        let transform = self
            .transforms
            .get(export)
            .cloned()
            .ok_or_else(|| BridgeError::MissingExport {
                name: export.to_string(),
            })?;
        self.bump(|s| s.calls += 1);

        let mem_len = self.memory_len();
        let in_end = args.in_ptr as u64 + args.in_len as u64;
        let out_end = args.out_ptr as u64 + args.out_cap as u64;
        if in_end > mem_len || out_end > mem_len {
            return Err(Self::trap(export, "out of bounds memory access".to_string()));
        }

        let region = Rc::clone(&self.region.borrow());
        let mut input = vec![0u8; args.in_len as usize];
        region.read(args.in_ptr as usize, &mut input);
        let mut output = vec![0u8; args.out_cap as usize];

        let ret = transform(&input, &mut output);
        if ret > 0 {
            let written = (ret as usize).min(output.len());
            region.write(args.out_ptr as usize, &output[..written]);
        }
        Ok(ret)
    }

    fn export_names(&self) -> Vec<String> {
        let mut names: Vec<String> = exports::REQUIRED.iter().map(|s| s.to_string()).collect();
        if self.version.is_some() {
            names.push(exports::VERSION.to_string());
        }
        let mut transforms: Vec<String> = self.transforms.keys().cloned().collect();
        transforms.sort();
        names.extend(transforms);
        names
    }

    fn version(&self) -> Option<u32> {
        self.version
    }
}

/// Builder for [`NativeModule`]
pub struct NativeModuleBuilder {
    initial_pages: u32,
    max_pages: u32,
    transforms: HashMap<String, NativeTransform>,
    version: Option<u32>,
}

impl NativeModuleBuilder {
    pub fn new() -> Self {
        Self {
            initial_pages: 1,
            max_pages: DEFAULT_MAX_PAGES,
            transforms: HashMap::new(),
            version: None,
        }
    }

    pub fn initial_pages(mut self, pages: u32) -> Self {
        self.initial_pages = pages;
        self
    }

    pub fn max_pages(mut self, pages: u32) -> Self {
        self.max_pages = pages;
        self
    }

    /// Value returned by the `version` export
    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Register a transform export
    pub fn transform<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&[u8], &mut [u8]) -> i32 + 'static,
    {
        self.transforms.insert(name.to_string(), Rc::new(f));
        self
    }

    pub fn build(self) -> NativeModule {
        let pages = self.initial_pages.max(1);
        NativeModule {
            region: RefCell::new(Rc::new(NativeRegion {
                bytes: RefCell::new(vec![0u8; pages as usize * PAGE_SIZE]),
                live: Cell::new(true),
            })),
            max_pages: self.max_pages.max(pages),
            heap: RefCell::new(Heap::new()),
            transforms: self.transforms,
            version: self.version,
            stats: Cell::new(NativeStats::default()),
            grow_on_allocation: Cell::new(None),
        }
    }
}

impl Default for NativeModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a native module for a variant from its bytes
pub type ModuleFactory = Box<dyn Fn(Variant, &[u8]) -> BridgeResult<NativeModule>>;

/// Instantiator producing [`NativeModule`]s
pub struct NativeInstantiator {
    factory: ModuleFactory,
    simd: bool,
    validate: bool,
    instantiations: Cell<u32>,
}

impl NativeInstantiator {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(Variant, &[u8]) -> BridgeResult<NativeModule> + 'static,
    {
        Self {
            factory: Box::new(factory),
            simd: true,
            validate: false,
            instantiations: Cell::new(0),
        }
    }

    /// Override what the SIMD feature probe reports
    pub fn with_simd(mut self, supported: bool) -> Self {
        self.simd = supported;
        self
    }

    /// Run [`ModuleValidator`] over the bytes before calling the factory
    pub fn validating(mut self) -> Self {
        self.validate = true;
        self
    }

    /// Number of instantiation attempts so far
    pub fn instantiations(&self) -> u32 {
        self.instantiations.get()
    }
}

impl Instantiator for NativeInstantiator {
    fn instantiate(
        &self,
        variant: Variant,
        bytes: Vec<u8>,
    ) -> LocalBoxFuture<'_, BridgeResult<Rc<dyn ModuleHandle>>> {
        Box::pin(async move {
            self.instantiations.set(self.instantiations.get() + 1);
            if self.validate {
                ModuleValidator::validate(variant, &bytes)?;
            }
            let module = (self.factory)(variant, &bytes)?;
            Ok(Rc::new(module) as Rc<dyn ModuleHandle>)
        })
    }

    fn supports_simd(&self) -> bool {
        self.simd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> NativeModule {
        NativeModule::builder()
            .transform("echo", |input, out| {
                if out.len() < input.len() {
                    return -1;
                }
                out[..input.len()].copy_from_slice(input);
                input.len() as i32
            })
            .build()
    }

    #[test]
    fn test_module_exports() {
        let module = NativeModule::builder()
            .version(3)
            .transform("b", |_, _| 0)
            .transform("a", |_, _| 0)
            .build();
        assert_eq!(
            module.export_names(),
            vec!["memory", "alloc_bytes", "free_bytes", "version", "a", "b"]
        );
        assert!(module.has_export("a"));
        assert!(!module.has_export("c"));
        assert_eq!(module.version(), Some(3));
    }

    #[test]
    fn test_alloc_never_returns_null() {
        let module = echo();
        let a = module.alloc(0).unwrap();
        let b = module.alloc(5).unwrap();
        assert!(a >= HEAP_BASE);
        assert_eq!(b, a + ALIGN);
        assert_eq!(b % ALIGN, 0);
    }

    #[test]
    fn test_free_reuses_space() {
        let module = echo();
        let a = module.alloc(32).unwrap();
        let _b = module.alloc(32).unwrap();
        module.free(a, 32).unwrap();
        let c = module.alloc(16).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_free_top_block_lowers_top() {
        let module = echo();
        let a = module.alloc(64).unwrap();
        module.free(a, 64).unwrap();
        assert_eq!(module.alloc(64).unwrap(), a);
    }

    #[test]
    fn test_free_length_mismatch_traps() {
        let module = echo();
        let a = module.alloc(32).unwrap();
        assert!(matches!(
            module.free(a, 16),
            Err(BridgeError::ForeignTrap { .. })
        ));
        assert!(matches!(
            module.free(a + 8, 32),
            Err(BridgeError::ForeignTrap { .. })
        ));
        module.free(a, 32).unwrap();
    }

    #[test]
    fn test_allocation_grows_memory() {
        let module = echo();
        let region = module.memory().unwrap();
        assert_eq!(module.pages(), 1);

        module.alloc(PAGE_SIZE as u32).unwrap();

        assert_eq!(module.pages(), 2);
        assert!(!region.is_live());
        assert_eq!(region.byte_len(), 0);
        assert_eq!(module.stats().grows, 1);
    }

    #[test]
    fn test_growth_preserves_contents() {
        let module = echo();
        let ptr = module.alloc(4).unwrap();
        module.memory().unwrap().write(ptr as usize, b"keep");
        module.grow(2).unwrap();

        let mut buf = [0u8; 4];
        module.memory().unwrap().read(ptr as usize, &mut buf);
        assert_eq!(&buf, b"keep");
        assert_eq!(module.pages(), 3);
    }

    #[test]
    fn test_grow_on_allocation() {
        let module = echo();
        module.grow_on_allocation(2);
        module.alloc(8).unwrap();
        assert_eq!(module.stats().grows, 0);
        module.alloc(8).unwrap();
        assert_eq!(module.stats().grows, 1);
    }

    #[test]
    fn test_grow_past_max_fails() {
        let module = NativeModule::builder().max_pages(2).build();
        module.grow(1).unwrap();
        assert!(matches!(
            module.grow(1),
            Err(BridgeError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_call_transform() {
        let module = echo();
        let in_ptr = module.alloc(3).unwrap();
        let out_ptr = module.alloc(3).unwrap();
        let region = module.memory().unwrap();
        region.write(in_ptr as usize, b"abc");

        let ret = module
            .call(
                "echo",
                TransformArgs {
                    in_ptr,
                    in_len: 3,
                    out_ptr,
                    out_cap: 3,
                },
            )
            .unwrap();
        assert_eq!(ret, 3);

        let mut out = [0u8; 3];
        region.read(out_ptr as usize, &mut out);
        assert_eq!(&out, b"abc");
        assert_eq!(module.stats().calls, 1);
    }

    #[test]
    fn test_call_missing_export() {
        let module = echo();
        let args = TransformArgs {
            in_ptr: 0,
            in_len: 0,
            out_ptr: 0,
            out_cap: 0,
        };
        assert!(matches!(
            module.call("nope", args),
            Err(BridgeError::MissingExport { .. })
        ));
    }

    #[test]
    fn test_call_out_of_bounds_traps() {
        let module = echo();
        let args = TransformArgs {
            in_ptr: u32::MAX - 1,
            in_len: 8,
            out_ptr: 0,
            out_cap: 0,
        };
        assert!(matches!(
            module.call("echo", args),
            Err(BridgeError::ForeignTrap { .. })
        ));
    }

    #[test]
    fn test_instantiator_counts_attempts() {
        let inst = NativeInstantiator::new(|variant, _bytes| match variant {
            Variant::Simd => Err(BridgeError::InstantiationFailed {
                variant,
                reason: "no simd".to_string(),
            }),
            Variant::Base => Ok(NativeModule::builder().build()),
        })
        .with_simd(false);

        assert!(!inst.supports_simd());
        let simd = futures::executor::block_on(inst.instantiate(Variant::Simd, vec![]));
        assert!(simd.is_err());
        let base = futures::executor::block_on(inst.instantiate(Variant::Base, vec![]));
        assert!(base.is_ok());
        assert_eq!(inst.instantiations(), 2);
    }

    #[test]
    fn test_validating_instantiator_rejects_garbage() {
        let inst = NativeInstantiator::new(|_, _| Ok(NativeModule::builder().build())).validating();

        let bad = futures::executor::block_on(inst.instantiate(Variant::Simd, b"garbage".to_vec()));
        assert!(matches!(
            bad,
            Err(BridgeError::InstantiationFailed {
                variant: Variant::Simd,
                ..
            })
        ));

        let bytes = crate::bridge::loader::abi_module_bytes();
        let good = futures::executor::block_on(inst.instantiate(Variant::Base, bytes));
        assert!(good.is_ok());
    }
}
