pub mod brackets;
pub mod component;
pub mod context;
pub mod registry;
pub mod subgraph;

// Re-export commonly used types
pub use brackets::{BracketContext, BracketSide, PortRef};
pub use component::{Component, ComponentConfig, ComponentEvent, LifecycleFn, ProcessFn};
pub use context::{PortAddress, ProcessContext, ProcessInput, ProcessOutput};
pub use registry::{ComponentLoader, ComponentRegistry, Factory, LoadContext};
