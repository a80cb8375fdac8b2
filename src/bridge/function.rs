//! Wrapped functions
//!
//! A [`FunctionDescriptor`] maps a transform export to a local call name,
//! a return kind, an output-size rule and a buffer-reuse policy. The
//! [`Bridge`] interprets a table of descriptors: there is no generated code
//! per export, every call goes through the same marshaller.

use super::abi::Variant;
use super::alloc::{Allocator, ReuseSlot};
use super::bootstrap::{Bootstrapper, InitOptions};
use super::codec::{self, ReturnKind, Value};
use super::config::{BridgeConfig, InitMode};
use super::error::{BridgeError, BridgeResult};
use super::marshal::{CallOutput, Marshaller, OutputSize};
use super::registry::{InstanceRegistry, ModuleHandle};
use super::stream::{BoxedProcessor, ChunkTransform, Segmentation};
use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// How one transform export is exposed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    /// Export name in the module
    pub export: String,
    /// Local call name; defaults to the export name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub returns: ReturnKind,
    /// Output buffer rule; scalar kinds are sized by their width instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_size: Option<OutputSize>,
    /// Keep a persistent buffer pair for this function
    #[serde(default)]
    pub reuse: bool,
}

impl FunctionDescriptor {
    pub fn new(export: &str) -> Self {
        Self {
            export: export.to_string(),
            name: None,
            returns: ReturnKind::Bytes,
            output_size: None,
            reuse: false,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn returns(mut self, kind: ReturnKind) -> Self {
        self.returns = kind;
        self
    }

    pub fn output_size(mut self, size: OutputSize) -> Self {
        self.output_size = Some(size);
        self
    }

    pub fn reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn local_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.export)
    }

    /// Reject descriptors whose output buffer could not be sized
    pub fn validate(&self) -> BridgeResult<()> {
        let invalid = |reason: &str| BridgeError::InvalidDescriptor {
            name: self.local_name().to_string(),
            reason: reason.to_string(),
        };

        if self.export.trim().is_empty() {
            return Err(invalid("export name is empty"));
        }
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(invalid("local name is empty"));
        }
        match (self.returns, self.output_size) {
            (ReturnKind::Scalar(_), Some(_)) => {
                Err(invalid("scalar returns are sized by their type"))
            }
            (ReturnKind::Array(_), None) => Err(invalid("array returns need an output_size")),
            (_, Some(OutputSize::Fixed(0))) => Err(invalid("fixed output size is zero")),
            (_, Some(OutputSize::Scaled { div: 0, .. })) => {
                Err(invalid("output size divisor is zero"))
            }
            _ => Ok(()),
        }
    }

    /// Output capacity for an input of `input_len` bytes
    pub fn output_capacity(&self, input_len: usize) -> BridgeResult<u32> {
        match self.returns.fixed_width() {
            Some(width) => Ok(width),
            None => self.output_size.unwrap_or_default().capacity_for(input_len),
        }
    }
}

/// Dispatcher over a table of wrapped functions
pub struct Bridge {
    marshaller: Marshaller,
    functions: Vec<FunctionDescriptor>,
    index: HashMap<String, usize>,
    slots: RefCell<HashMap<String, ReuseSlot>>,
    bootstrapper: Option<Rc<Bootstrapper>>,
    init_mode: InitMode,
    init_options: InitOptions,
}

impl Bridge {
    pub fn new(registry: Rc<InstanceRegistry>) -> Self {
        Self {
            marshaller: Marshaller::new(registry),
            functions: Vec::new(),
            index: HashMap::new(),
            slots: RefCell::new(HashMap::new()),
            bootstrapper: None,
            init_mode: InitMode::Eager,
            init_options: InitOptions::default(),
        }
    }

    /// Bridge with every function of `config` registered
    pub fn from_config(
        config: &BridgeConfig,
        registry: Rc<InstanceRegistry>,
    ) -> BridgeResult<Self> {
        config.validate()?;
        let mut bridge = Self::new(registry);
        bridge.init_mode = config.init;
        bridge.init_options = config.init_options();
        for descriptor in &config.functions {
            bridge.register(descriptor.clone())?;
        }
        Ok(bridge)
    }

    /// Attach the bootstrapper used by [`Bridge::initialize`] and lazy calls
    pub fn with_bootstrapper(mut self, bootstrapper: Rc<Bootstrapper>, mode: InitMode) -> Self {
        self.bootstrapper = Some(bootstrapper);
        self.init_mode = mode;
        self
    }

    pub fn with_init_options(mut self, options: InitOptions) -> Self {
        self.init_options = options;
        self
    }

    pub fn register(&mut self, descriptor: FunctionDescriptor) -> BridgeResult<()> {
        descriptor.validate()?;
        let name = descriptor.local_name().to_string();
        if self.index.contains_key(&name) {
            return Err(BridgeError::InvalidDescriptor {
                name,
                reason: "already registered".to_string(),
            });
        }
        self.index.insert(name, self.functions.len());
        self.functions.push(descriptor);
        Ok(())
    }

    pub fn functions(&self) -> &[FunctionDescriptor] {
        &self.functions
    }

    pub fn descriptor(&self, name: &str) -> BridgeResult<&FunctionDescriptor> {
        self.index
            .get(name)
            .map(|&i| &self.functions[i])
            .ok_or_else(|| BridgeError::UnknownFunction {
                name: name.to_string(),
            })
    }

    pub fn registry(&self) -> &Rc<InstanceRegistry> {
        self.marshaller.registry()
    }

    pub fn init_mode(&self) -> InitMode {
        self.init_mode
    }

    /// Publish a module directly, bypassing the bootstrapper
    pub fn set_active_module(&self, handle: Rc<dyn ModuleHandle>) -> BridgeResult<()> {
        self.registry().set_instance(handle, None)
    }

    /// Variant of the active module, if it came from the bootstrapper
    pub fn active_variant(&self) -> Option<Variant> {
        self.registry().active_variant()
    }

    /// Run (or join) initialization with the configured options
    pub async fn initialize(&self) -> BridgeResult<Variant> {
        self.initialize_with(self.init_options).await
    }

    pub async fn initialize_with(&self, options: InitOptions) -> BridgeResult<Variant> {
        let bootstrapper = self
            .bootstrapper
            .as_ref()
            .ok_or(BridgeError::NotInitialized)?;
        bootstrapper.initialize(options).await
    }

    /// Call `name` and decode its output by the declared return kind
    pub fn call(&self, name: &str, input: &[u8]) -> BridgeResult<Value> {
        let descriptor = self.descriptor(name)?;
        let output = self.invoke(descriptor, input)?;
        codec::decode(&output.bytes, descriptor.returns)
    }

    /// Call `name` with a typed slice as input
    pub fn call_typed<T: Pod>(&self, name: &str, input: &[T]) -> BridgeResult<Value> {
        self.call(name, bytemuck::cast_slice(input))
    }

    /// Call `name` and return the written bytes undecoded
    pub fn call_bytes(&self, name: &str, input: &[u8]) -> BridgeResult<Vec<u8>> {
        let descriptor = self.descriptor(name)?;
        Ok(self.invoke(descriptor, input)?.bytes)
    }

    /// [`Bridge::call`], after the shared initialization in lazy mode.
    ///
    /// Joins whatever initialization was started last, whatever its
    /// backend. The configured options are used only when none was started
    /// (and no module was set directly) or the last one failed.
    pub async fn call_async(&self, name: &str, input: &[u8]) -> BridgeResult<Value> {
        if self.init_mode == InitMode::Lazy {
            if let Some(bootstrapper) = &self.bootstrapper {
                let untouched = bootstrapper.requested_backend().is_none();
                if !(untouched && self.registry().is_initialized()) {
                    bootstrapper.ensure(self.init_options).await?;
                }
            }
        }
        self.call(name, input)
    }

    /// Segmenting transform whose segments are processed by `name`
    pub fn stream(
        &self,
        name: &str,
        segmentation: Segmentation,
    ) -> BridgeResult<ChunkTransform<BoxedProcessor<'_>>> {
        let name = self.descriptor(name)?.local_name().to_string();
        let process: BoxedProcessor<'_> =
            Box::new(move |segment: &[u8]| self.call_bytes(&name, segment));
        ChunkTransform::new(segmentation, process)
    }

    /// [`Bridge::stream`] holding its own reference to the bridge
    pub fn owned_stream(
        self: &Rc<Self>,
        name: &str,
        segmentation: Segmentation,
    ) -> BridgeResult<ChunkTransform<BoxedProcessor<'static>>> {
        let name = self.descriptor(name)?.local_name().to_string();
        let bridge = Rc::clone(self);
        let process: BoxedProcessor<'static> =
            Box::new(move |segment: &[u8]| bridge.call_bytes(&name, segment));
        ChunkTransform::new(segmentation, process)
    }

    /// `(input, output)` capacity of a function's reuse slot
    pub fn slot_capacity(&self, name: &str) -> Option<(u32, u32)> {
        self.slots
            .borrow()
            .get(name)
            .map(|s| (s.input_capacity(), s.output_capacity()))
    }

    /// Number of buffer (re)allocations made by a function's reuse slot
    pub fn slot_allocations(&self, name: &str) -> u32 {
        self.slots.borrow().get(name).map_or(0, ReuseSlot::allocations)
    }

    /// Free every reuse slot's buffers.
    ///
    /// Slots are recreated on the next call. Buffers of a module that has
    /// since been replaced are dropped without a foreign call.
    pub fn release_buffers(&self) -> BridgeResult<()> {
        let slots: Vec<ReuseSlot> = self.slots.borrow_mut().drain().map(|(_, s)| s).collect();
        let alloc = match Allocator::from_registry(self.registry()) {
            Ok(alloc) => alloc,
            Err(BridgeError::NotInitialized) => return Ok(()),
            Err(e) => return Err(e),
        };
        for mut slot in slots {
            slot.teardown(&alloc)?;
        }
        Ok(())
    }

    fn invoke(&self, descriptor: &FunctionDescriptor, input: &[u8]) -> BridgeResult<CallOutput> {
        let capacity = descriptor.output_capacity(input.len())?;
        if !descriptor.reuse {
            return self
                .marshaller
                .invoke(&descriptor.export, input, capacity, None);
        }

        let mut slots = self.slots.borrow_mut();
        let slot = slots
            .entry(descriptor.local_name().to_string())
            .or_default();
        self.marshaller
            .invoke(&descriptor.export, input, capacity, Some(slot))
    }
}
