pub mod context;
pub mod registry;
pub mod resources;

pub use context::{Engine, EngineBuilder, RequestContext, Scope};
pub use registry::{ClassFactory, ClassRegistry};
pub use resources::{ManagedResource, ResourceRegistry};
