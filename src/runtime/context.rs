use super::registry::ClassRegistry;
use super::resources::{ManagedResource, ResourceRegistry};
use crate::ado::bridge::BridgeProvider;
use crate::config::DataAccessConfig;
use crate::core::ObjectRef;
use crate::drivers::{DriverRegistry, WireDriver};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide state: configuration, drivers, classes and the optional
/// desktop bridge. Shared by every request.
pub struct Engine {
    pub config: DataAccessConfig,
    pub drivers: DriverRegistry,
    pub classes: ClassRegistry,
    bridge: Option<Arc<dyn BridgeProvider>>,
}

impl Engine {
    pub fn new(config: DataAccessConfig) -> Arc<Self> {
        EngineBuilder::new().with_config(config).build()
    }

    pub fn bridge(&self) -> Option<Arc<dyn BridgeProvider>> {
        self.bridge.clone()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            config: DataAccessConfig::default(),
            drivers: DriverRegistry::new(),
            classes: ClassRegistry::with_builtin_classes(),
            bridge: None,
        }
    }
}

/// Builder for constructing an Engine
///
/// # Example
/// ```ignore
/// let engine = EngineBuilder::new()
///     .with_config(DataAccessConfig::from_env())
///     .build();
/// ```
pub struct EngineBuilder {
    engine: Engine,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            engine: Engine::default(),
        }
    }

    pub fn with_config(mut self, config: DataAccessConfig) -> Self {
        self.engine.config = config;
        self
    }

    /// Replaces the compiled-in driver for the same backend
    pub fn with_driver(mut self, driver: Arc<dyn WireDriver>) -> Self {
        self.engine.drivers.register(driver);
        self
    }

    pub fn with_bridge_provider(mut self, provider: Arc<dyn BridgeProvider>) -> Self {
        self.engine.bridge = Some(provider);
        self
    }

    pub fn build(self) -> Arc<Engine> {
        Arc::new(self.engine)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-owning view of a request handed to every object it creates.
///
/// Holds the registry weakly: objects never keep a finished request alive.
#[derive(Clone)]
pub struct Scope {
    engine: Arc<Engine>,
    root: Arc<PathBuf>,
    resources: Weak<ResourceRegistry>,
    request_id: u64,
}

impl Scope {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn config(&self) -> &DataAccessConfig {
        &self.engine.config
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Registers a resource for teardown; a no-op once the request is gone
    pub fn register(&self, resource: Arc<dyn ManagedResource>) {
        match self.resources.upgrade() {
            Some(registry) => registry.register(resource),
            None => debug!(
                request_id = self.request_id,
                kind = resource.resource_kind(),
                "request already finished; resource is unmanaged"
            ),
        }
    }

    /// Resolves a relative path against the request's site root
    pub fn map_path(&self, path: &str) -> PathBuf {
        let trimmed = path.trim();
        let candidate = Path::new(trimmed);
        if trimmed == ":memory:" || candidate.is_absolute() {
            return candidate.to_path_buf();
        }
        self.root.join(trimmed.trim_start_matches(['/', '\\']))
    }

    /// `CreateObject(progid)`
    pub fn create_object(&self, progid: &str) -> Option<ObjectRef> {
        let factory = self.engine.classes.get(progid)?;
        trace!(request_id = self.request_id, progid, "create object");
        Some(factory(self))
    }
}

/// Per-request context; owns the resource registry and drains it at teardown
pub struct RequestContext {
    scope: Scope,
    resources: Arc<ResourceRegistry>,
}

impl RequestContext {
    pub fn new(engine: Arc<Engine>) -> Self {
        let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::with_root(engine, root)
    }

    pub fn with_root(engine: Arc<Engine>, root: impl Into<PathBuf>) -> Self {
        let resources = Arc::new(ResourceRegistry::new());
        let request_id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        debug!(request_id, "request started");
        Self {
            scope: Scope {
                engine,
                root: Arc::new(root.into()),
                resources: Arc::downgrade(&resources),
                request_id,
            },
            resources,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.scope.engine
    }

    pub fn request_id(&self) -> u64 {
        self.scope.request_id
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn create_object(&self, progid: &str) -> Option<ObjectRef> {
        self.scope.create_object(progid)
    }

    pub fn map_path(&self, path: &str) -> PathBuf {
        self.scope.map_path(path)
    }

    /// Request shutdown: cleans up every registered resource once
    pub fn teardown(&self) -> usize {
        let cleaned = self.resources.drain();
        if cleaned > 0 {
            debug!(request_id = self.request_id(), cleaned, "request torn down");
        }
        cleaned
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        self.teardown();
    }
}
