//! Module bootstrapper
//!
//! Obtains the bytes of a variant, instantiates it, and publishes the
//! handle to the registry. The SIMD/baseline choice is an explicit
//! two-attempt strategy ([`select_variant`]) so it can be tested without a
//! WASM engine.
//!
//! Initialization is idempotent per backend: the bootstrapper keeps one
//! shared future, and callers asking for the same backend get a clone of
//! it instead of a second instantiation.

use super::abi::Variant;
use super::error::{BridgeError, BridgeResult};
use super::registry::{InstanceRegistry, ModuleHandle};
use crate::console_log;
use futures::future::{FutureExt, LocalBoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::str::FromStr;

/// Variant selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// SIMD if it instantiates, baseline otherwise
    #[default]
    Auto,
    /// SIMD only; failure propagates
    Simd,
    /// Baseline only
    #[serde(alias = "baseline")]
    Base,
}

impl Backend {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Backend::Auto => "auto",
            Backend::Simd => "simd",
            Backend::Base => "base",
        }
    }
}

impl FromStr for Backend {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Backend::Auto),
            "simd" => Ok(Backend::Simd),
            "base" | "baseline" => Ok(Backend::Base),
            other => Err(BridgeError::InvalidConfig {
                reason: format!("unknown backend '{}'", other),
            }),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options of one `initialize` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InitOptions {
    pub backend: Backend,
}

impl InitOptions {
    pub fn backend(backend: Backend) -> Self {
        Self { backend }
    }
}

/// Produces the raw bytes of a variant
pub trait ByteSource {
    /// Fails with `SourceUnavailable` if the bytes cannot be obtained
    fn load(&self, variant: Variant) -> LocalBoxFuture<'_, BridgeResult<Vec<u8>>>;
}

/// Bytes compiled into the host or held in memory
#[derive(Debug, Clone, Default)]
pub struct EmbeddedSource {
    simd: Option<Rc<[u8]>>,
    base: Option<Rc<[u8]>>,
}

impl EmbeddedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source with both variants
    pub fn pair(simd: impl Into<Rc<[u8]>>, base: impl Into<Rc<[u8]>>) -> Self {
        Self::new().with(Variant::Simd, simd).with(Variant::Base, base)
    }

    pub fn with(mut self, variant: Variant, bytes: impl Into<Rc<[u8]>>) -> Self {
        let bytes = Some(bytes.into());
        match variant {
            Variant::Simd => self.simd = bytes,
            Variant::Base => self.base = bytes,
        }
        self
    }
}

impl ByteSource for EmbeddedSource {
    fn load(&self, variant: Variant) -> LocalBoxFuture<'_, BridgeResult<Vec<u8>>> {
        let bytes = match variant {
            Variant::Simd => self.simd.as_deref(),
            Variant::Base => self.base.as_deref(),
        }
        .map(<[u8]>::to_vec)
        .ok_or_else(|| BridgeError::SourceUnavailable {
            variant,
            reason: "no embedded bytes".to_string(),
        });
        Box::pin(futures::future::ready(bytes))
    }
}

/// Reads `<dir>/<module>_<variant>.wasm` from the filesystem
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Clone)]
pub struct FileSource {
    dir: std::path::PathBuf,
    module: String,
}

#[cfg(not(target_arch = "wasm32"))]
impl FileSource {
    pub fn new(dir: impl Into<std::path::PathBuf>, module: &str) -> Self {
        Self {
            dir: dir.into(),
            module: module.to_string(),
        }
    }

    pub fn path(&self, variant: Variant) -> std::path::PathBuf {
        self.dir.join(variant.file_name(&self.module))
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl ByteSource for FileSource {
    fn load(&self, variant: Variant) -> LocalBoxFuture<'_, BridgeResult<Vec<u8>>> {
        let path = self.path(variant);
        let bytes = std::fs::read(&path).map_err(|e| BridgeError::SourceUnavailable {
            variant,
            reason: format!("{}: {}", path.display(), e),
        });
        Box::pin(futures::future::ready(bytes))
    }
}

/// Turns variant bytes into a live module
pub trait Instantiator {
    /// Fails with `InstantiationFailed` if the bytes do not compile or
    /// do not link against the host imports
    fn instantiate(
        &self,
        variant: Variant,
        bytes: Vec<u8>,
    ) -> LocalBoxFuture<'_, BridgeResult<Rc<dyn ModuleHandle>>>;

    /// Feature probe: whether this host can run SIMD code at all
    fn supports_simd(&self) -> bool {
        true
    }
}

/// Outcome of variant selection
#[derive(Clone)]
pub struct Selected {
    pub variant: Variant,
    pub handle: Rc<dyn ModuleHandle>,
}

impl fmt::Debug for Selected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selected")
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

/// Pick and instantiate a variant for `backend`.
///
/// `Auto` tries SIMD first (unless the host cannot run it) and falls back
/// to the baseline on any failure; it fails only with the baseline's
/// error. `Simd` and `Base` make exactly one attempt.
pub async fn select_variant<F, Fut>(
    backend: Backend,
    simd_supported: bool,
    mut attempt: F,
) -> BridgeResult<Selected>
where
    F: FnMut(Variant) -> Fut,
    Fut: Future<Output = BridgeResult<Rc<dyn ModuleHandle>>>,
{
    let variant = match backend {
        Backend::Simd => Variant::Simd,
        Backend::Base => Variant::Base,
        Backend::Auto if !simd_supported => {
            console_log!("[bootstrap] SIMD not supported by host, using base");
            Variant::Base
        }
        Backend::Auto => match attempt(Variant::Simd).await {
            Ok(handle) => {
                return Ok(Selected {
                    variant: Variant::Simd,
                    handle,
                });
            }
            Err(e) => {
                console_log!("[bootstrap] SIMD variant unusable ({}), falling back to base", e);
                Variant::Base
            }
        },
    };

    let handle = attempt(variant).await?;
    Ok(Selected { variant, handle })
}

/// Shared initialization result; resolves to the variant that was selected
pub type InitFuture = Shared<LocalBoxFuture<'static, BridgeResult<Variant>>>;

struct Pending {
    backend: Backend,
    future: InitFuture,
}

/// Loads, instantiates and publishes a module
pub struct Bootstrapper {
    registry: Rc<InstanceRegistry>,
    source: Rc<dyn ByteSource>,
    instantiator: Rc<dyn Instantiator>,
    pending: Rc<RefCell<Option<Pending>>>,
    /// Id of the newest initialization; older ones do not publish
    ticket: Rc<Cell<u64>>,
}

impl Bootstrapper {
    pub fn new(
        registry: Rc<InstanceRegistry>,
        source: Rc<dyn ByteSource>,
        instantiator: Rc<dyn Instantiator>,
    ) -> Self {
        Self {
            registry,
            source,
            instantiator,
            pending: Rc::new(RefCell::new(None)),
            ticket: Rc::new(Cell::new(0)),
        }
    }

    pub fn registry(&self) -> &Rc<InstanceRegistry> {
        &self.registry
    }

    /// Start (or join) initialization for `options.backend`.
    ///
    /// The same backend joins the in-flight or completed initialization;
    /// a different backend starts a new one whose result replaces the
    /// active module. A failed initialization is not kept, so asking
    /// again retries. An initialization superseded before it publishes
    /// resolves with the outcome of the newest one.
    pub fn initialize(&self, options: InitOptions) -> InitFuture {
        let mut pending = self.pending.borrow_mut();
        if let Some(p) = pending.as_ref() {
            let failed = matches!(p.future.peek(), Some(Err(_)));
            if p.backend == options.backend && !failed {
                return p.future.clone();
            }
        }

        let ticket = self.ticket.get() + 1;
        self.ticket.set(ticket);
        let future = self.run(options.backend, ticket).boxed_local().shared();
        *pending = Some(Pending {
            backend: options.backend,
            future: future.clone(),
        });
        future
    }

    /// Join the latest initialization whatever its backend.
    ///
    /// Starts one with `options` only when none was started or the latest
    /// one failed.
    pub fn ensure(&self, options: InitOptions) -> InitFuture {
        let live = self
            .pending
            .borrow()
            .as_ref()
            .filter(|p| !matches!(p.future.peek(), Some(Err(_))))
            .map(|p| p.future.clone());
        live.unwrap_or_else(|| self.initialize(options))
    }

    /// Wait for the current initialization
    pub async fn ready(&self) -> BridgeResult<Variant> {
        let pending = self.pending.borrow().as_ref().map(|p| p.future.clone());
        match pending {
            Some(future) => future.await,
            None => Err(BridgeError::NotInitialized),
        }
    }

    /// Backend of the latest `initialize` call
    pub fn requested_backend(&self) -> Option<Backend> {
        self.pending.borrow().as_ref().map(|p| p.backend)
    }

    fn run(
        &self,
        backend: Backend,
        ticket: u64,
    ) -> impl Future<Output = BridgeResult<Variant>> + 'static {
        let registry = Rc::clone(&self.registry);
        let source = Rc::clone(&self.source);
        let instantiator = Rc::clone(&self.instantiator);
        let tickets = Rc::clone(&self.ticket);
        let pending = Rc::clone(&self.pending);

        async move {
            let simd_supported = instantiator.supports_simd();
            let attempt = |variant: Variant| {
                let source = Rc::clone(&source);
                let instantiator = Rc::clone(&instantiator);
                async move {
                    let bytes = source.load(variant).await?;
                    instantiator.instantiate(variant, bytes).await
                }
            };
            let selected = select_variant(backend, simd_supported, attempt).await?;

            if tickets.get() != ticket {
                console_log!(
                    "[bootstrap] {} initialization superseded, not publishing",
                    backend
                );
                let latest = pending.borrow().as_ref().map(|p| p.future.clone());
                return match latest {
                    Some(latest) => latest.await,
                    None => Err(BridgeError::NotInitialized),
                };
            }
            registry.set_instance(selected.handle, Some(selected.variant))?;
            console_log!("[bootstrap] backend {} -> {} variant", backend, selected.variant);
            Ok(selected.variant)
        }
    }
}
