//! Browser host
//!
//! Runs variants through the JS `WebAssembly` API:
//! - `WebAssembly.instantiate` for instantiation, `WebAssembly.validate`
//!   over a tiny SIMD module as the feature probe
//! - `fetch` for variant bytes
//! - `memory.buffer` identity to detect growth (the old `ArrayBuffer` is
//!   detached and a new one takes its place)
//!
//! Also exports the JS surface: `Bridge` and `ChunkTransform` classes.

use crate::bridge::abi::{IMPORT_NAMESPACE, SIMD_PROBE, TransformArgs, Variant, exports};
use crate::bridge::bootstrap::{Backend, Bootstrapper, ByteSource, InitOptions, Instantiator};
use crate::bridge::codec::Value;
use crate::bridge::config::BridgeConfig;
use crate::bridge::error::{BridgeError, BridgeResult};
use crate::bridge::function::Bridge;
use crate::bridge::loader::ModuleValidator;
use crate::bridge::registry::{InstanceRegistry, MemoryRegion, ModuleHandle};
use crate::bridge::stream::{BoxedProcessor, ChunkTransform, Segmentation};
use futures::future::LocalBoxFuture;
use js_sys::{Array, ArrayBuffer, Function, Object, Reflect, Uint8Array, WebAssembly};
use std::rc::Rc;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::{JsFuture, future_to_promise};

/// Message of a thrown JS value
fn js_reason(value: &JsValue) -> String {
    value
        .dyn_ref::<js_sys::Error>()
        .map(|e| String::from(e.message()))
        .or_else(|| value.as_string())
        .unwrap_or_else(|| format!("{:?}", value))
}

impl From<BridgeError> for JsValue {
    fn from(err: BridgeError) -> Self {
        let js_err = js_sys::Error::new(&err.to_string());
        js_err.set_name(err.name());
        if let Some(code) = err.foreign_code() {
            let _ = Reflect::set(&js_err, &"code".into(), &JsValue::from(code));
        }
        js_err.into()
    }
}

/// One `ArrayBuffer` of a `WebAssembly.Memory`
struct JsRegion {
    memory: WebAssembly::Memory,
    buffer: ArrayBuffer,
}

impl JsRegion {
    fn current(memory: &WebAssembly::Memory) -> Self {
        Self {
            memory: memory.clone(),
            buffer: memory.buffer().unchecked_into(),
        }
    }

    fn bytes(&self, offset: usize, len: usize) -> Uint8Array {
        Uint8Array::new_with_byte_offset_and_length(&self.buffer, offset as u32, len as u32)
    }
}

impl MemoryRegion for JsRegion {
    fn byte_len(&self) -> usize {
        // Detached buffers report zero
        self.buffer.byte_length() as usize
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        self.bytes(offset, dst.len()).copy_to(dst);
    }

    fn write(&self, offset: usize, src: &[u8]) {
        self.bytes(offset, src.len()).copy_from(src);
    }

    fn is_live(&self) -> bool {
        Object::is(&self.memory.buffer(), &self.buffer)
    }
}

/// A `WebAssembly.Instance` exposing the bridge ABI
pub struct JsModule {
    exports: Object,
    memory: WebAssembly::Memory,
    alloc: Function,
    free: Function,
}

impl JsModule {
    pub fn new(instance: &WebAssembly::Instance) -> BridgeResult<Self> {
        let exports = instance.exports();
        let memory = Self::export(&exports, exports::MEMORY)?
            .dyn_into::<WebAssembly::Memory>()
            .map_err(|_| BridgeError::WrongExportType {
                name: exports::MEMORY.to_string(),
                expected: "memory",
            })?;
        let alloc = Self::function(&exports, exports::ALLOC)?;
        let free = Self::function(&exports, exports::FREE)?;
        Ok(Self {
            exports,
            memory,
            alloc,
            free,
        })
    }

    fn export(exports: &Object, name: &str) -> BridgeResult<JsValue> {
        let value = Reflect::get(exports, &JsValue::from_str(name)).unwrap_or(JsValue::UNDEFINED);
        if value.is_undefined() {
            return Err(BridgeError::MissingExport {
                name: name.to_string(),
            });
        }
        Ok(value)
    }

    fn function(exports: &Object, name: &str) -> BridgeResult<Function> {
        Self::export(exports, name)?
            .dyn_into::<Function>()
            .map_err(|_| BridgeError::WrongExportType {
                name: name.to_string(),
                expected: "function",
            })
    }

    fn trap(export: &str, err: JsValue) -> BridgeError {
        BridgeError::ForeignTrap {
            export: export.to_string(),
            reason: js_reason(&err),
        }
    }
}

/// i32 results arrive as JS numbers; pointers above 2 GiB come back negative
fn as_u32(value: &JsValue) -> u32 {
    value.as_f64().map_or(0, |v| v as i64 as u32)
}

impl ModuleHandle for JsModule {
    fn memory(&self) -> BridgeResult<Rc<dyn MemoryRegion>> {
        Ok(Rc::new(JsRegion::current(&self.memory)))
    }

    fn alloc(&self, len: u32) -> BridgeResult<u32> {
        let ret = self
            .alloc
            .call1(&JsValue::NULL, &JsValue::from(len))
            .map_err(|e| Self::trap(exports::ALLOC, e))?;
        Ok(as_u32(&ret))
    }

    fn free(&self, ptr: u32, len: u32) -> BridgeResult<()> {
        self.free
            .call2(&JsValue::NULL, &JsValue::from(ptr), &JsValue::from(len))
            .map_err(|e| Self::trap(exports::FREE, e))?;
        Ok(())
    }

    fn call(&self, export: &str, args: TransformArgs) -> BridgeResult<i32> {
        let function = Self::function(&self.exports, export)?;
        let argv: Array = args.as_array().iter().map(|&a| JsValue::from(a)).collect();
        let ret = function
            .apply(&JsValue::NULL, &argv)
            .map_err(|e| Self::trap(export, e))?;
        Ok(as_u32(&ret) as i32)
    }

    fn export_names(&self) -> Vec<String> {
        Object::keys(&self.exports)
            .iter()
            .filter_map(|k| k.as_string())
            .collect()
    }

    fn version(&self) -> Option<u32> {
        let function = Self::function(&self.exports, exports::VERSION).ok()?;
        function.call0(&JsValue::NULL).ok().map(|v| as_u32(&v))
    }
}

/// Instantiates through `WebAssembly.instantiate` with a host imports object
pub struct WebAssemblyInstantiator {
    imports: Object,
}

impl WebAssemblyInstantiator {
    /// `imports` defaults to `{ env: {} }`; an object without `env` gets one
    pub fn new(imports: Option<Object>) -> Self {
        let imports = imports.unwrap_or_else(Object::new);
        let namespace = JsValue::from_str(IMPORT_NAMESPACE);
        if !Reflect::has(&imports, &namespace).unwrap_or(false) {
            let _ = Reflect::set(&imports, &namespace, &Object::new());
        }
        Self { imports }
    }
}

impl Instantiator for WebAssemblyInstantiator {
    fn instantiate(
        &self,
        variant: Variant,
        bytes: Vec<u8>,
    ) -> LocalBoxFuture<'_, BridgeResult<Rc<dyn ModuleHandle>>> {
        Box::pin(async move {
            let fail = |reason: String| BridgeError::InstantiationFailed { variant, reason };
            ModuleValidator::validate(variant, &bytes)?;

            let promise = WebAssembly::instantiate_buffer(&bytes, &self.imports);
            let result = JsFuture::from(promise)
                .await
                .map_err(|e| fail(js_reason(&e)))?;
            let instance: WebAssembly::Instance = Reflect::get(&result, &"instance".into())
                .map_err(|e| fail(js_reason(&e)))?
                .dyn_into()
                .map_err(|_| fail("result has no instance".to_string()))?;

            let module = JsModule::new(&instance).map_err(|e| fail(e.to_string()))?;
            Ok(Rc::new(module) as Rc<dyn ModuleHandle>)
        })
    }

    fn supports_simd(&self) -> bool {
        let probe = Uint8Array::from(&SIMD_PROBE[..]);
        WebAssembly::validate(&probe.into()).unwrap_or(false)
    }
}

/// Fetches `<base_url>/<module>_<variant>.wasm`
pub struct FetchSource {
    base_url: String,
    module: String,
}

impl FetchSource {
    pub fn new(base_url: &str, module: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            module: module.to_string(),
        }
    }

    pub fn url(&self, variant: Variant) -> String {
        let file = variant.file_name(&self.module);
        if self.base_url.is_empty() {
            file
        } else {
            format!("{}/{}", self.base_url, file)
        }
    }

    async fn fetch(&self, variant: Variant) -> Result<Vec<u8>, String> {
        let window = web_sys::window().ok_or("no window object")?;
        let url = self.url(variant);

        let resp: web_sys::Response = JsFuture::from(window.fetch_with_str(&url))
            .await
            .map_err(|e| format!("fetch {} failed: {}", url, js_reason(&e)))?
            .dyn_into()
            .map_err(|_| "fetch did not return a Response".to_string())?;
        if !resp.ok() {
            return Err(format!("{}: HTTP {}", url, resp.status()));
        }

        let buffer = JsFuture::from(resp.array_buffer().map_err(|e| js_reason(&e))?)
            .await
            .map_err(|e| js_reason(&e))?;
        Ok(Uint8Array::new(&buffer).to_vec())
    }
}

impl ByteSource for FetchSource {
    fn load(&self, variant: Variant) -> LocalBoxFuture<'_, BridgeResult<Vec<u8>>> {
        Box::pin(async move {
            self.fetch(variant)
                .await
                .map_err(|reason| BridgeError::SourceUnavailable { variant, reason })
        })
    }
}

/// Bytes of a JS input value.
///
/// Accepts `Uint8Array`, any other `ArrayBuffer` view (its bytes as laid
/// out in memory), `ArrayBuffer`, and strings (UTF-8).
pub fn input_bytes(value: &JsValue) -> BridgeResult<Vec<u8>> {
    if let Some(s) = value.as_string() {
        return Ok(s.into_bytes());
    }
    if let Some(array) = value.dyn_ref::<Uint8Array>() {
        return Ok(array.to_vec());
    }
    if value.is_instance_of::<ArrayBuffer>() {
        return Ok(Uint8Array::new(value).to_vec());
    }
    if ArrayBuffer::is_view(value) {
        let field = |name: &str| Reflect::get(value, &JsValue::from_str(name)).ok();
        let buffer = field("buffer");
        let offset = field("byteOffset").and_then(|v| v.as_f64());
        let len = field("byteLength").and_then(|v| v.as_f64());
        if let (Some(buffer), Some(offset), Some(len)) = (buffer, offset, len) {
            let view = Uint8Array::new_with_byte_offset_and_length(&buffer, offset as u32, len as u32);
            return Ok(view.to_vec());
        }
    }
    Err(BridgeError::TypeError {
        reason: format!("cannot convert {:?} to bytes", value),
    })
}

/// JS representation of a decoded value
pub fn value_to_js(value: Value) -> JsValue {
    match value {
        Value::Bytes(v) | Value::U8Array(v) => Uint8Array::from(&v[..]).into(),
        Value::I8(v) => v.into(),
        Value::U8(v) => v.into(),
        Value::I16(v) => v.into(),
        Value::U16(v) => v.into(),
        Value::I32(v) => v.into(),
        Value::U32(v) => v.into(),
        Value::F32(v) => v.into(),
        Value::F64(v) => v.into(),
        Value::I8Array(v) => js_sys::Int8Array::from(&v[..]).into(),
        Value::I16Array(v) => js_sys::Int16Array::from(&v[..]).into(),
        Value::U16Array(v) => js_sys::Uint16Array::from(&v[..]).into(),
        Value::I32Array(v) => js_sys::Int32Array::from(&v[..]).into(),
        Value::U32Array(v) => js_sys::Uint32Array::from(&v[..]).into(),
        Value::F32Array(v) => js_sys::Float32Array::from(&v[..]).into(),
        Value::F64Array(v) => js_sys::Float64Array::from(&v[..]).into(),
    }
}

/// Segmentation from a plain JS object, e.g. `{ delimiter: 10 }` or `"lines"`
fn segmentation_from_js(value: &JsValue) -> BridgeResult<Segmentation> {
    if value.is_undefined() || value.is_null() {
        return Ok(Segmentation::Passthrough);
    }
    let json = js_sys::JSON::stringify(value)
        .ok()
        .and_then(|s| s.as_string())
        .ok_or_else(|| BridgeError::TypeError {
            reason: "segmentation is not serializable".to_string(),
        })?;
    serde_json::from_str(&json).map_err(|e| BridgeError::InvalidConfig {
        reason: format!("segmentation: {}", e),
    })
}

/// JS-facing bridge over the process-wide registry
#[wasm_bindgen(js_name = Bridge)]
pub struct JsBridge {
    bridge: Rc<Bridge>,
}

#[wasm_bindgen(js_class = Bridge)]
impl JsBridge {
    /// `new Bridge(configJson, baseUrl, imports?)`
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: &str, base_url: &str, imports: Option<Object>) -> Result<JsBridge, JsValue> {
        let config = BridgeConfig::from_json(config_json)?;
        let registry = InstanceRegistry::global();
        let bootstrapper = Rc::new(Bootstrapper::new(
            Rc::clone(&registry),
            Rc::new(FetchSource::new(base_url, &config.name)),
            Rc::new(WebAssemblyInstantiator::new(imports)),
        ));
        let bridge = Bridge::from_config(&config, registry)?.with_bootstrapper(bootstrapper, config.init);
        Ok(JsBridge {
            bridge: Rc::new(bridge),
        })
    }

    /// Resolves to the variant name (`"simd"` / `"base"`)
    pub fn initialize(&self, backend: Option<String>) -> Result<js_sys::Promise, JsValue> {
        let bridge = Rc::clone(&self.bridge);
        let options = backend
            .map(|name| name.parse::<Backend>().map(InitOptions::backend))
            .transpose()?;
        Ok(future_to_promise(async move {
            let variant = match options {
                Some(options) => bridge.initialize_with(options).await?,
                None => bridge.initialize().await?,
            };
            Ok(JsValue::from_str(variant.as_str()))
        }))
    }

    pub fn call(&self, name: &str, input: JsValue) -> Result<JsValue, JsValue> {
        let bytes = input_bytes(&input)?;
        Ok(value_to_js(self.bridge.call(name, &bytes)?))
    }

    /// Like `call`, after awaiting initialization in lazy mode
    #[wasm_bindgen(js_name = callAsync)]
    pub fn call_async(&self, name: String, input: JsValue) -> js_sys::Promise {
        let bridge = Rc::clone(&self.bridge);
        let bytes = input_bytes(&input);
        future_to_promise(async move {
            let value = bridge.call_async(&name, &bytes?).await?;
            Ok(value_to_js(value))
        })
    }

    #[wasm_bindgen(js_name = setActiveModule)]
    pub fn set_active_module(&self, instance: &WebAssembly::Instance) -> Result<(), JsValue> {
        let module = JsModule::new(instance)?;
        self.bridge.set_active_module(Rc::new(module))?;
        Ok(())
    }

    #[wasm_bindgen(js_name = createTransform)]
    pub fn create_transform(&self, name: &str, segmentation: JsValue) -> Result<JsChunkTransform, JsValue> {
        let segmentation = segmentation_from_js(&segmentation)?;
        let inner = self.bridge.owned_stream(name, segmentation)?;
        Ok(JsChunkTransform { inner })
    }

    #[wasm_bindgen(js_name = activeBackend)]
    pub fn active_backend(&self) -> Option<String> {
        self.bridge.active_variant().map(|v| v.as_str().to_string())
    }

    #[wasm_bindgen(js_name = releaseBuffers)]
    pub fn release_buffers(&self) -> Result<(), JsValue> {
        self.bridge.release_buffers()?;
        Ok(())
    }

    pub fn functions(&self) -> Array {
        self.bridge
            .functions()
            .iter()
            .map(|f| JsValue::from_str(f.local_name()))
            .collect()
    }
}

/// JS-facing chunk transform.
///
/// Also a valid `Transformer`: `new TransformStream(bridge.createTransform(..))`
/// calls `transform(chunk, controller)` per chunk and `flush(controller)`
/// at the end.
#[wasm_bindgen(js_name = ChunkTransform)]
pub struct JsChunkTransform {
    inner: ChunkTransform<BoxedProcessor<'static>>,
}

fn enqueue(controller: &JsValue, segment: &[u8]) -> Result<(), JsValue> {
    let enqueue: Function = Reflect::get(controller, &"enqueue".into())?.dyn_into()?;
    enqueue.call1(controller, &Uint8Array::from(segment).into())?;
    Ok(())
}

#[wasm_bindgen(js_class = ChunkTransform)]
impl JsChunkTransform {
    /// Processed segments completed by `chunk`, as `Uint8Array`s
    pub fn push(&mut self, chunk: JsValue) -> Result<Array, JsValue> {
        let bytes = input_bytes(&chunk)?;
        let segments = self.inner.push(&bytes)?;
        Ok(segments
            .iter()
            .map(|s| JsValue::from(Uint8Array::from(&s[..])))
            .collect())
    }

    /// `TransformStream` hook: push and enqueue every completed segment
    pub fn transform(&mut self, chunk: JsValue, controller: JsValue) -> Result<(), JsValue> {
        let bytes = input_bytes(&chunk)?;
        for segment in self.inner.push(&bytes)? {
            enqueue(&controller, &segment)?;
        }
        Ok(())
    }

    /// Final segment, or `undefined`. With a controller (the
    /// `TransformStream` hook) the segment is enqueued as well.
    pub fn flush(&mut self, controller: Option<JsValue>) -> Result<JsValue, JsValue> {
        let Some(segment) = self.inner.finish()? else {
            return Ok(JsValue::UNDEFINED);
        };
        if let Some(controller) = controller.filter(|c| !c.is_undefined()) {
            enqueue(&controller, &segment)?;
        }
        Ok(Uint8Array::from(&segment[..]).into())
    }

    #[wasm_bindgen(js_name = carryLength)]
    pub fn carry_length(&self) -> usize {
        self.inner.carry_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_bindgen_test::*;

    wasm_bindgen_test_configure!(run_in_browser);

    #[wasm_bindgen_test]
    fn test_input_bytes() {
        assert_eq!(input_bytes(&JsValue::from_str("héllo")).unwrap(), "héllo".as_bytes());
        let array = Uint8Array::from(&[1u8, 2, 3][..]);
        assert_eq!(input_bytes(&array.into()).unwrap(), vec![1, 2, 3]);
        let words = js_sys::Uint16Array::from(&[1u16, 256][..]);
        assert_eq!(input_bytes(&words.into()).unwrap(), vec![1, 0, 0, 1]);
        assert!(matches!(
            input_bytes(&JsValue::from(5)),
            Err(BridgeError::TypeError { .. })
        ));
    }

    #[wasm_bindgen_test]
    fn test_simd_probe_validates() {
        let inst = WebAssemblyInstantiator::new(None);
        // Every current browser engine ships SIMD
        assert!(inst.supports_simd());
    }

    #[wasm_bindgen_test]
    fn test_fetch_url() {
        let src = FetchSource::new("/pkg/", "lines");
        assert_eq!(src.url(Variant::Simd), "/pkg/lines_simd.wasm");
        assert_eq!(FetchSource::new("", "m").url(Variant::Base), "m_base.wasm");
    }

    #[wasm_bindgen_test]
    fn test_segmentation_from_js() {
        let obj = js_sys::JSON::parse(r#"{"delimiter":10}"#).unwrap();
        assert_eq!(segmentation_from_js(&obj).unwrap(), Segmentation::Delimiter(10));
        assert_eq!(
            segmentation_from_js(&JsValue::UNDEFINED).unwrap(),
            Segmentation::Passthrough
        );
    }
}
