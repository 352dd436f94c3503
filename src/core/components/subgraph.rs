//! Components that wrap a whole graph.
//!
//! The nested network runs on the parent's scheduler. Exported ports are the
//! inner processes' own port objects, so packets cross the boundary without
//! an extra hop. While the nested network runs, the wrapping component holds
//! one unit of load.

use super::component::{Component, ComponentConfig};
use super::registry::LoadContext;
use crate::core::errors::{FlowError, PortDirection, Result};
use crate::core::network::{Graph, Network};
use indexmap::IndexMap;
use log::{debug, warn};
use std::cell::Cell;
use std::rc::{Rc, Weak};

/// Instantiate `graph` as a component
pub fn create(graph: &Graph, ctx: &LoadContext) -> Result<Rc<Component>> {
    let network = Network::create(
        graph.clone(),
        ctx.loader.clone(),
        ctx.scheduler.clone(),
        ctx.config.clone(),
    )?;

    let mut in_ports = IndexMap::new();
    for (public, exported) in &graph.inports {
        let inner = network.component(&exported.process)?;
        let port = inner.in_port(&exported.port).cloned().ok_or_else(|| {
            FlowError::port_not_found(&exported.process, &exported.port, PortDirection::In)
        })?;
        in_ports.insert(public.clone(), port);
    }
    let mut out_ports = IndexMap::new();
    for (public, exported) in &graph.outports {
        let inner = network.component(&exported.process)?;
        let port = inner.out_port(&exported.port).cloned().ok_or_else(|| {
            FlowError::port_not_found(&exported.process, &exported.port, PortDirection::Out)
        })?;
        out_ports.insert(public.clone(), port);
    }

    let description = graph
        .description
        .clone()
        .unwrap_or_else(|| graph.name.clone());
    let config = ComponentConfig::new()
        .description(&description)
        .icon("sitemap")
        .setup(|component| match component.subgraph_network() {
            Some(network) => network.start(),
            None => Ok(()),
        })
        .teardown(|component| match component.subgraph_network() {
            Some(network) => network.stop(),
            None => Ok(()),
        });
    let component = Component::assemble(config, in_ports, out_ports, Some(network.clone()));
    track_activity(&network, &component);
    debug!(
        target: "rflow::component",
        "subgraph '{}' ready with {} processes",
        graph.name,
        network.processes().len()
    );
    Ok(component)
}

/// Mirror the nested network's running state as load on the wrapper
fn track_activity(network: &Network, component: &Rc<Component>) {
    let running = Rc::new(Cell::new(0usize));

    let weak: Weak<Component> = Rc::downgrade(component);
    let counter = running.clone();
    network.events().subscribe("start", move |_| {
        if let Some(component) = weak.upgrade() {
            counter.set(counter.get() + 1);
            component.begin_activity();
        }
    });

    let weak: Weak<Component> = Rc::downgrade(component);
    network.events().subscribe("end", move |_| {
        let Some(component) = weak.upgrade() else {
            return;
        };
        if running.get() == 0 {
            return;
        }
        running.set(running.get() - 1);
        if let Err(err) = component.end_activity() {
            warn!(
                target: "rflow::component",
                "{} failed to finish after subgraph end: {}",
                component.node_id(),
                err
            );
        }
    });
}
