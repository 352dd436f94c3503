use super::component::Component;
use super::subgraph;
use crate::core::config::NetworkConfig;
use crate::core::errors::{FlowError, Result};
use crate::core::network::Graph;
use crate::core::scheduler::Scheduler;
use indexmap::IndexMap;
use log::debug;
use serde_json::Value;
use std::rc::Rc;

/// Everything a loader needs to instantiate a component for a node
#[derive(Clone)]
pub struct LoadContext {
    pub scheduler: Scheduler,
    /// Loader used for nested graphs
    pub loader: Rc<dyn ComponentLoader>,
    /// Node metadata from the graph
    pub metadata: Value,
    pub config: NetworkConfig,
}

/// Resolves component names to fresh component instances
pub trait ComponentLoader {
    fn load(&self, name: &str, ctx: &LoadContext) -> Result<Rc<Component>>;

    /// Names of every component the loader can produce
    fn list(&self) -> Vec<String>;
}

pub type Factory = Rc<dyn Fn(&LoadContext) -> Result<Rc<Component>>>;

/// In-memory component loader backed by factory functions
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    factories: IndexMap<String, Factory>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component factory under `name`, replacing any previous one
    pub fn register(
        &mut self,
        name: &str,
        factory: impl Fn(&LoadContext) -> Result<Rc<Component>> + 'static,
    ) -> &mut Self {
        if self.factories.insert(name.to_string(), Rc::new(factory)).is_some() {
            debug!(target: "rflow::component", "component '{}' re-registered", name);
        }
        self
    }

    /// Register a graph that loads as a subgraph component
    pub fn register_graph(&mut self, name: &str, graph: Graph) -> &mut Self {
        self.register(name, move |ctx| subgraph::create(&graph, ctx))
    }

    pub fn has(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl ComponentLoader for ComponentRegistry {
    fn load(&self, name: &str, ctx: &LoadContext) -> Result<Rc<Component>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| FlowError::component_not_found(name))?;
        factory(ctx)
    }

    fn list(&self) -> Vec<String> {
        self.names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::components::ComponentConfig;
    use crate::core::ports::InPortConfig;

    fn context(registry: ComponentRegistry) -> LoadContext {
        LoadContext {
            scheduler: Scheduler::new(),
            loader: Rc::new(registry),
            metadata: Value::Null,
            config: NetworkConfig::default(),
        }
    }

    #[test]
    fn test_register_and_load() {
        let mut registry = ComponentRegistry::new();
        registry.register("Sink", |_| {
            Component::new(ComponentConfig::new().inport("in", InPortConfig::new()))
        });
        assert!(registry.has("Sink"));
        assert_eq!(registry.list(), vec!["Sink".to_string()]);

        let ctx = context(registry.clone());
        let first = registry.load("Sink", &ctx).unwrap();
        let second = registry.load("Sink", &ctx).unwrap();
        assert!(!Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_unknown_component() {
        let registry = ComponentRegistry::new();
        let ctx = context(registry.clone());
        let err = registry.load("Missing", &ctx).unwrap_err();
        assert_eq!(err.to_string(), "component `Missing` not available");
    }

    #[test]
    fn test_factory_sees_node_metadata() {
        let mut registry = ComponentRegistry::new();
        registry.register("Labelled", |ctx| {
            let label = ctx.metadata["label"].as_str().unwrap_or("none").to_string();
            Component::new(ComponentConfig::new().description(&label))
        });
        let mut ctx = context(registry.clone());
        ctx.metadata = serde_json::json!({"label": "counter"});
        let component = registry.load("Labelled", &ctx).unwrap();
        assert_eq!(component.description(), "counter");
    }
}
