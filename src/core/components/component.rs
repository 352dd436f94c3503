use super::brackets::{
    BracketContexts, BracketKey, BracketSide, ContextRef, PortOutput, PortRef, ProcessResult,
    ResultRef,
};
use super::context::{ProcessContext, ProcessInput, ProcessOutput};
use crate::core::errors::{FlowError, PortDirection, Result};
use crate::core::events::{Subject, Topic};
use crate::core::network::Network;
use crate::core::ports::{InPort, InPortConfig, OutPort, OutPortConfig, Port};
use crate::core::values::{Packet, PacketKind};
use indexmap::IndexMap;
use log::{debug, trace};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

/// Process function, invoked once per triggering packet
pub type ProcessFn = Rc<dyn Fn(&ProcessInput, &ProcessOutput) -> Result<()>>;

/// Setup or teardown hook
pub type LifecycleFn = Rc<dyn Fn(&Component) -> Result<()>>;

type Finalizer = Box<dyn FnOnce() -> Result<()>>;

#[derive(Debug, Clone, PartialEq)]
pub enum ComponentEvent {
    /// Carries the load after activation
    Activate(usize),
    /// Carries the load after deactivation
    Deactivate(usize),
    Start,
    End,
    Icon(String),
}

impl Topic for ComponentEvent {
    fn topic(&self) -> &'static str {
        match self {
            ComponentEvent::Activate(_) => "activate",
            ComponentEvent::Deactivate(_) => "deactivate",
            ComponentEvent::Start => "start",
            ComponentEvent::End => "end",
            ComponentEvent::Icon(_) => "icon",
        }
    }
}

/// Declarative component definition
#[derive(Clone)]
pub struct ComponentConfig {
    pub description: String,
    pub icon: Option<String>,
    pub in_ports: IndexMap<String, InPortConfig>,
    pub out_ports: IndexMap<String, OutPortConfig>,
    /// Deliver results in activation order
    pub ordered: bool,
    /// `None` lets the first OpenBracket switch the component to ordered mode
    pub auto_ordering: Option<bool>,
    /// Reading input marks the context as activated
    pub activate_on_input: bool,
    /// Inport name to outports its brackets are relayed to. `None` means
    /// `in -> [out, error]`.
    pub forward_brackets: Option<IndexMap<String, Vec<String>>>,
    pub process: Option<ProcessFn>,
    pub setup: Option<LifecycleFn>,
    pub teardown: Option<LifecycleFn>,
}

impl ComponentConfig {
    pub fn new() -> Self {
        Self {
            description: String::new(),
            icon: None,
            in_ports: IndexMap::new(),
            out_ports: IndexMap::new(),
            ordered: false,
            auto_ordering: None,
            activate_on_input: true,
            forward_brackets: None,
            process: None,
            setup: None,
            teardown: None,
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn icon(mut self, icon: &str) -> Self {
        self.icon = Some(icon.to_string());
        self
    }

    /// Declare an input port
    pub fn inport(mut self, name: &str, config: InPortConfig) -> Self {
        self.in_ports.insert(name.to_string(), config);
        self
    }

    /// Declare an output port
    pub fn outport(mut self, name: &str, config: OutPortConfig) -> Self {
        self.out_ports.insert(name.to_string(), config);
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn auto_ordering(mut self, auto_ordering: bool) -> Self {
        self.auto_ordering = Some(auto_ordering);
        self
    }

    pub fn activate_on_input(mut self, activate: bool) -> Self {
        self.activate_on_input = activate;
        self
    }

    /// Relay brackets arriving on `inport` to `outports`
    pub fn forward(mut self, inport: &str, outports: &[&str]) -> Self {
        self.forward_brackets
            .get_or_insert_with(IndexMap::new)
            .insert(
                inport.to_string(),
                outports.iter().map(|p| p.to_string()).collect(),
            );
        self
    }

    /// Disable bracket forwarding entirely
    pub fn no_forwarding(mut self) -> Self {
        self.forward_brackets = Some(IndexMap::new());
        self
    }

    pub fn process(
        mut self,
        process: impl Fn(&ProcessInput, &ProcessOutput) -> Result<()> + 'static,
    ) -> Self {
        self.process = Some(Rc::new(process));
        self
    }

    pub fn setup(mut self, setup: impl Fn(&Component) -> Result<()> + 'static) -> Self {
        self.setup = Some(Rc::new(setup));
        self
    }

    pub fn teardown(mut self, teardown: impl Fn(&Component) -> Result<()> + 'static) -> Self {
        self.teardown = Some(Rc::new(teardown));
        self
    }
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop forwarding entries that name ports the component does not have
fn prune_forwarding(
    table: IndexMap<String, Vec<String>>,
    in_ports: &IndexMap<String, Rc<InPort>>,
    out_ports: &IndexMap<String, Rc<OutPort>>,
) -> IndexMap<String, Vec<String>> {
    table
        .into_iter()
        .filter(|(inport, _)| in_ports.contains_key(inport))
        .map(|(inport, outports)| {
            let kept: Vec<String> = outports
                .into_iter()
                .filter(|outport| out_ports.contains_key(outport))
                .collect();
            (inport, kept)
        })
        .filter(|(_, outports)| !outports.is_empty())
        .collect()
}

fn default_forwarding() -> IndexMap<String, Vec<String>> {
    let mut table = IndexMap::new();
    table.insert(
        "in".to_string(),
        vec!["out".to_string(), "error".to_string()],
    );
    table
}

fn port_list(ports: &[PortRef]) -> String {
    ports
        .iter()
        .map(PortRef::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// A processing unit: owns ports, a load counter, the ordered output queue
/// and the bracket context stacks used for bracket forwarding.
pub struct Component {
    self_ref: Weak<Component>,
    node_id: RefCell<Option<String>>,
    description: String,
    icon: RefCell<Option<String>>,
    in_ports: IndexMap<String, Rc<InPort>>,
    out_ports: IndexMap<String, Rc<OutPort>>,
    ordered: bool,
    auto_ordering: Cell<Option<bool>>,
    activate_on_input: bool,
    forward_brackets: IndexMap<String, Vec<String>>,
    process: Option<ProcessFn>,
    setup: Option<LifecycleFn>,
    teardown: Option<LifecycleFn>,
    /// Nested network when this component wraps a graph
    subgraph: Option<Rc<Network>>,
    load: Cell<usize>,
    output_q: RefCell<VecDeque<ResultRef>>,
    bracket_context: RefCell<BracketContexts>,
    started: Cell<bool>,
    /// Shutdown completions waiting for load to drop to zero
    finalizers: RefCell<Vec<Finalizer>>,
    events: Subject<ComponentEvent>,
}

impl Component {
    /// Build a component and its ports from a definition
    pub fn new(config: ComponentConfig) -> Result<Rc<Self>> {
        let mut in_ports = IndexMap::new();
        for (name, port) in &config.in_ports {
            in_ports.insert(name.clone(), InPort::new(port.clone())?);
        }
        let mut out_ports = IndexMap::new();
        for (name, port) in &config.out_ports {
            out_ports.insert(name.clone(), OutPort::new(port.clone())?);
        }
        Ok(Self::assemble(config, in_ports, out_ports, None))
    }

    /// Build a component around existing ports. Ports are bound to the new
    /// component unless it wraps a subgraph, whose ports stay owned by the
    /// inner processes.
    pub(crate) fn assemble(
        config: ComponentConfig,
        in_ports: IndexMap<String, Rc<InPort>>,
        out_ports: IndexMap<String, Rc<OutPort>>,
        subgraph: Option<Rc<Network>>,
    ) -> Rc<Self> {
        let table = config.forward_brackets.unwrap_or_else(default_forwarding);
        let forward_brackets = if config.process.is_some() {
            prune_forwarding(table, &in_ports, &out_ports)
        } else {
            table
        };
        let bind = subgraph.is_none();
        Rc::new_cyclic(|weak| {
            if bind {
                for (name, port) in &in_ports {
                    port.bind(weak.clone(), name);
                }
                for (name, port) in &out_ports {
                    port.set_name(name);
                }
            }
            Self {
                self_ref: weak.clone(),
                node_id: RefCell::new(None),
                description: config.description,
                icon: RefCell::new(config.icon),
                in_ports,
                out_ports,
                ordered: config.ordered,
                auto_ordering: Cell::new(config.auto_ordering),
                activate_on_input: config.activate_on_input,
                forward_brackets,
                process: config.process,
                setup: config.setup,
                teardown: config.teardown,
                subgraph,
                load: Cell::new(0),
                output_q: RefCell::new(VecDeque::new()),
                bracket_context: RefCell::new(BracketContexts::default()),
                started: Cell::new(false),
                finalizers: RefCell::new(Vec::new()),
                events: Subject::new(),
            }
        })
    }

    pub fn node_id(&self) -> String {
        self.node_id.borrow().clone().unwrap_or_default()
    }

    /// Assign the process id, informing the component's own ports
    pub fn set_node_id(&self, id: &str) {
        *self.node_id.borrow_mut() = Some(id.to_string());
        if self.is_subgraph() {
            return;
        }
        for port in self.in_ports.values() {
            port.set_node(id);
        }
        for port in self.out_ports.values() {
            port.set_node(id);
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn icon(&self) -> Option<String> {
        self.icon.borrow().clone()
    }

    pub fn set_icon(&self, icon: &str) {
        *self.icon.borrow_mut() = Some(icon.to_string());
        self.events.emit(&ComponentEvent::Icon(icon.to_string()));
    }

    pub fn events(&self) -> &Subject<ComponentEvent> {
        &self.events
    }

    pub fn in_ports(&self) -> &IndexMap<String, Rc<InPort>> {
        &self.in_ports
    }

    pub fn out_ports(&self) -> &IndexMap<String, Rc<OutPort>> {
        &self.out_ports
    }

    pub fn in_port(&self, name: &str) -> Option<&Rc<InPort>> {
        self.in_ports.get(name)
    }

    pub fn out_port(&self, name: &str) -> Option<&Rc<OutPort>> {
        self.out_ports.get(name)
    }

    pub fn is_subgraph(&self) -> bool {
        self.subgraph.is_some()
    }

    pub fn subgraph_network(&self) -> Option<&Rc<Network>> {
        self.subgraph.as_ref()
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered || self.auto_ordering.get() == Some(true)
    }

    pub(crate) fn activates_on_input(&self) -> bool {
        self.activate_on_input
    }

    /// Number of activations currently in flight
    pub fn load(&self) -> usize {
        self.load.get()
    }

    pub fn is_running(&self) -> bool {
        self.load.get() > 0
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    pub fn output_queue_len(&self) -> usize {
        self.output_q.borrow().len()
    }

    pub fn forward_brackets(&self) -> &IndexMap<String, Vec<String>> {
        &self.forward_brackets
    }

    pub fn is_forwarding_inport(&self, port: &str) -> bool {
        self.forward_brackets.contains_key(port)
    }

    pub fn is_forwarding_outport(&self, inport: &str, outport: &str) -> bool {
        self.forward_brackets
            .get(inport)
            .map_or(false, |outports| outports.iter().any(|p| p == outport))
    }

    /// Depth of a bracket context stack
    pub fn bracket_depth(
        &self,
        side: BracketSide,
        port: &str,
        scope: Option<&str>,
        index: Option<usize>,
    ) -> usize {
        let key = self.bracket_key(side, port, scope, index);
        self.bracket_context.borrow().depth(&key)
    }

    /// Run the setup hook and mark the component started
    pub fn start(&self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }
        if let Some(setup) = self.setup.clone() {
            setup(self).map_err(|err| FlowError::lifecycle(self.node_id(), err))?;
        }
        self.started.set(true);
        debug!(target: "rflow::component", "{} started", self.node_id());
        self.events.emit(&ComponentEvent::Start);
        Ok(())
    }

    /// Run the teardown hook, then finalize once every in-flight activation
    /// has completed. `on_finished` runs after finalization.
    pub fn shutdown(&self, on_finished: impl FnOnce() -> Result<()> + 'static) -> Result<()> {
        if let Some(teardown) = self.teardown.clone() {
            teardown(self).map_err(|err| FlowError::lifecycle(self.node_id(), err))?;
        }
        self.finalizers.borrow_mut().push(Box::new(on_finished));
        if self.load.get() > 0 {
            debug!(
                target: "rflow::component",
                "{} waiting for {} activations before shutdown",
                self.node_id(),
                self.load.get()
            );
            return Ok(());
        }
        self.finalize()
    }

    fn finalize(&self) -> Result<()> {
        for port in self.in_ports.values() {
            port.clear();
        }
        self.bracket_context.borrow_mut().clear();
        if self.started.replace(false) {
            debug!(target: "rflow::component", "{} ended", self.node_id());
            self.events.emit(&ComponentEvent::End);
        }
        let finalizers = std::mem::take(&mut *self.finalizers.borrow_mut());
        finalizers.into_iter().try_for_each(|finalizer| finalizer())
    }

    /// Send an error to an error port, surrounded by brackets for `groups`.
    /// Without a usable error port the error is returned to the caller.
    pub fn error(
        &self,
        err: FlowError,
        groups: &[Value],
        port: Option<&str>,
        scope: Option<&str>,
    ) -> Result<()> {
        let name = port.unwrap_or("error");
        let Some(out) = self
            .out_ports
            .get(name)
            .filter(|p| p.is_attached(None) || !p.is_required())
        else {
            return Err(err);
        };
        let scoped = |packet: Packet| match scope {
            Some(scope) => packet.with_scope(scope),
            None => packet,
        };
        for group in groups {
            out.send_ip(scoped(Packet::open_bracket(group.clone())))?;
        }
        out.send_ip(scoped(Packet::data(err.to_string())))?;
        for group in groups.iter().rev() {
            out.send_ip(scoped(Packet::close_bracket(group.clone())))?;
        }
        Ok(())
    }

    /// Handle a packet buffered by one of the component's inports
    pub fn handle_ip(&self, ip: Packet, port_name: &str) -> Result<()> {
        let Some(port) = self.in_ports.get(port_name).cloned() else {
            return Ok(());
        };
        if !port.is_triggering() {
            return Ok(());
        }
        if ip.is_open_bracket() && self.auto_ordering.get().is_none() && !self.ordered {
            debug!(
                target: "rflow::component",
                "{} port '{}' entered auto-ordering mode",
                self.node_id(),
                port_name
            );
            self.auto_ordering.set(Some(true));
        }

        if self.is_forwarding_inport(port_name) {
            match ip.kind {
                // Brackets are consumed by get() ahead of the next data packet
                PacketKind::OpenBracket => return Ok(()),
                PacketKind::CloseBracket => {
                    let buf = port.buffer(ip.scope.as_deref(), ip.index, false);
                    let data_packets = buf.iter().filter(|p| p.is_data()).count();
                    if self.output_q.borrow().len() >= self.load.get() && data_packets == 0 {
                        if !buf.first().map_or(false, |first| first.same_as(&ip)) {
                            return Ok(());
                        }
                        port.get(ip.scope.as_deref(), ip.index);
                        self.flush_close_bracket(port_name, ip)?;
                        return Ok(());
                    }
                    if data_packets == 0 {
                        return Ok(());
                    }
                }
                PacketKind::Data => {}
            }
        }

        let process = self.process.clone().ok_or_else(|| FlowError::ProcessNotDefined {
            node: self.node_id(),
        })?;
        let component = self
            .self_ref
            .upgrade()
            .ok_or_else(|| FlowError::InvalidState("component dropped".to_string()))?;
        let kind = ip.kind;
        let index = ip.index;
        let context = ProcessContext::new(
            ip,
            component,
            port.clone(),
            port_name,
            ProcessResult::new_ref(),
        );
        let input = ProcessInput::new(context.clone());
        let output = ProcessOutput::new(context.clone());

        if let Err(err) = process(&input, &output) {
            let deactivated = self.deactivate(&context);
            // Failures from downstream processes belong to them
            let handled = if err.is_wrapped() {
                output.done(None).and(Err(err))
            } else {
                output.done(Some(err))
            };
            return handled.and(deactivated);
        }
        if !context.is_activated() && !context.is_deactivated() {
            match index {
                Some(idx) if port.is_addressable() => debug!(
                    target: "rflow::component",
                    "{} packet on '{}[{}]' didn't match preconditions: {:?}",
                    self.node_id(),
                    port_name,
                    idx,
                    kind
                ),
                _ => debug!(
                    target: "rflow::component",
                    "{} packet on '{}' didn't match preconditions: {:?}",
                    self.node_id(),
                    port_name,
                    kind
                ),
            }
        }
        Ok(())
    }

    /// A close bracket that no pending activation will pick up: queue an
    /// entry that only emits it
    fn flush_close_bracket(&self, port_name: &str, ip: Packet) -> Result<()> {
        let key = self.bracket_key(BracketSide::In, port_name, ip.scope.as_deref(), ip.index);
        let popped = self.bracket_context.borrow_mut().pop(&key);
        let Some(context) = popped else {
            debug!(
                target: "rflow::component::brackets",
                "{} closeBracket-C on '{}' without open context: '{}'",
                self.node_id(),
                port_name,
                ip.data
            );
            return Ok(());
        };
        debug!(
            target: "rflow::component::brackets",
            "{} closeBracket-C from '{}' to {}: '{}'",
            self.node_id(),
            context.borrow().source,
            port_list(&context.borrow().ports),
            ip.data
        );
        context.borrow_mut().close_ip = Some(ip);
        let result = ProcessResult::new_ref();
        {
            let mut entry = result.borrow_mut();
            entry.resolved = true;
            entry.bracket_closing_after.push(context);
        }
        self.output_q.borrow_mut().push_back(result);
        self.process_output_queue()
    }

    fn acquire_load(&self) -> usize {
        let load = self.load.get() + 1;
        self.load.set(load);
        trace!(target: "rflow::component", "{} load {}", self.node_id(), load);
        self.events.emit(&ComponentEvent::Activate(load));
        load
    }

    /// Drop one unit of load. Never goes below zero; reaching zero completes
    /// a pending shutdown.
    fn release_load(&self) -> Result<()> {
        let load = self.load.get();
        if load == 0 {
            return Ok(());
        }
        self.load.set(load - 1);
        trace!(target: "rflow::component", "{} load {}", self.node_id(), load - 1);
        self.events.emit(&ComponentEvent::Deactivate(load - 1));
        if load == 1 && !self.finalizers.borrow().is_empty() {
            return self.finalize();
        }
        Ok(())
    }

    /// Mark activity not tied to a processing context, such as a running
    /// nested network
    pub(crate) fn begin_activity(&self) {
        self.acquire_load();
    }

    pub(crate) fn end_activity(&self) -> Result<()> {
        self.release_load()
    }

    pub(crate) fn activate(&self, context: &ProcessContext) {
        if context.is_activated() {
            return;
        }
        context.mark_activated();
        self.acquire_load();
        if self.is_ordered() {
            let result = context.result();
            let mut queue = self.output_q.borrow_mut();
            if !queue.iter().any(|entry| Rc::ptr_eq(entry, &result)) {
                queue.push_back(result);
            }
        }
    }

    pub(crate) fn deactivate(&self, context: &ProcessContext) -> Result<()> {
        if context.is_deactivated() {
            return Ok(());
        }
        let was_active = context.is_activated();
        context.mark_deactivated();
        // Queue flushes before load drops, so deactivate listeners and
        // shutdown finalizers observe the delivered output
        let flushed = if self.is_ordered() {
            self.process_output_queue()
        } else {
            Ok(())
        };
        let released = if was_active {
            self.release_load()
        } else {
            Ok(())
        };
        flushed.and(released)
    }

    pub(crate) fn queue_contains(&self, result: &ResultRef) -> bool {
        self.output_q
            .borrow()
            .iter()
            .any(|entry| Rc::ptr_eq(entry, result))
    }

    /// Whether `result` is the last pending result, ignoring entries that
    /// only carry closing brackets
    pub(crate) fn is_last_result(&self, result: &ResultRef) -> bool {
        let queue = self.output_q.borrow();
        let results: Vec<&ResultRef> = queue
            .iter()
            .filter(|entry| !entry.borrow().is_closing_only())
            .collect();
        let len = results.len();
        let load = self.load.get();
        match results.iter().position(|entry| Rc::ptr_eq(entry, result)) {
            Some(pos) if pos + 1 == len => true,
            None if load == len + 1 => true,
            _ => len <= 1 && load == 1,
        }
    }

    fn bracket_key(
        &self,
        side: BracketSide,
        port: &str,
        scope: Option<&str>,
        index: Option<usize>,
    ) -> BracketKey {
        let addressable = match side {
            BracketSide::In => self.in_ports.get(port).map_or(false, |p| p.is_addressable()),
            BracketSide::Out => self.out_ports.get(port).map_or(false, |p| p.is_addressable()),
        };
        BracketKey {
            side,
            port: port.to_string(),
            index: if addressable { index } else { None },
            scope: scope.map(str::to_string),
        }
    }

    pub(crate) fn push_bracket_context(
        &self,
        port: &str,
        scope: Option<&str>,
        index: Option<usize>,
        context: ContextRef,
    ) {
        let key = self.bracket_key(BracketSide::In, port, scope, index);
        self.bracket_context.borrow_mut().push(key, context);
    }

    pub(crate) fn pop_bracket_context(
        &self,
        port: &str,
        scope: Option<&str>,
        index: Option<usize>,
    ) -> Option<ContextRef> {
        let key = self.bracket_key(BracketSide::In, port, scope, index);
        self.bracket_context.borrow_mut().pop(&key)
    }

    pub(crate) fn bracket_stack(
        &self,
        port: &str,
        scope: Option<&str>,
        index: Option<usize>,
    ) -> Vec<ContextRef> {
        let key = self.bracket_key(BracketSide::In, port, scope, index);
        self.bracket_context.borrow().stack(&key)
    }

    /// Collect close brackets waiting right behind the last processed data
    /// packet, so they are emitted after this result (case B)
    pub(crate) fn close_dangling_brackets(&self, scope: Option<&str>, result: &ResultRef) {
        let keys = self
            .bracket_context
            .borrow()
            .keys_in_scope(BracketSide::In, scope);
        for key in keys {
            let last = self.bracket_context.borrow().last(&key);
            let Some(context) = last else {
                continue;
            };
            let (source, ip_scope, ip_index) = {
                let context = context.borrow();
                (context.source.clone(), context.ip.scope.clone(), context.ip.index)
            };
            let Some(port) = self.in_ports.get(&source) else {
                continue;
            };
            while port
                .peek(ip_scope.as_deref(), ip_index)
                .map_or(false, |ip| ip.is_close_bracket())
            {
                let ip = port.get(ip_scope.as_deref(), ip_index);
                let popped = self.bracket_context.borrow_mut().pop(&key);
                let Some(closed) = popped else {
                    break;
                };
                closed.borrow_mut().close_ip = ip;
                result.borrow_mut().bracket_closing_after.push(closed);
            }
        }
    }

    /// Append (or prepend) a packet to the result slot of an outport
    pub(crate) fn add_to_result(
        &self,
        result: &mut ProcessResult,
        port: &PortRef,
        mut ip: Packet,
        before: bool,
    ) -> Result<()> {
        let out = self.out_ports.get(&port.name).ok_or_else(|| {
            FlowError::port_not_found(self.node_id(), &port.name, PortDirection::Out)
        })?;
        let insert = |list: &mut Vec<Packet>, ip: Packet| {
            if before {
                list.insert(0, ip);
            } else {
                list.push(ip);
            }
        };
        let entry = result.outputs.entry(port.name.clone());
        if out.is_addressable() {
            let idx = port
                .index
                .or(ip.index)
                .ok_or_else(|| FlowError::IndexRequired { port: out.id() })?;
            ip.index = Some(idx);
            let slot = entry.or_insert_with(|| PortOutput::Indexed(BTreeMap::new()));
            if let PortOutput::Indexed(map) = slot {
                insert(map.entry(idx).or_default(), ip);
            }
            return Ok(());
        }
        let slot = entry.or_insert_with(|| PortOutput::Single(Vec::new()));
        if let PortOutput::Single(list) = slot {
            insert(list, ip);
        }
        Ok(())
    }

    /// Contexts from `inport` not yet relayed to `outport`, skipping brackets
    /// another inport already relayed there at the same depth
    fn forwardable_contexts(
        &self,
        inport: &str,
        outport: &PortRef,
        contexts: &[ContextRef],
    ) -> Vec<ContextRef> {
        if !self.is_forwarding_outport(inport, &outport.name) {
            return Vec::new();
        }
        let store = self.bracket_context.borrow();
        let mut forwardable = Vec::new();
        for (position, context) in contexts.iter().enumerate() {
            let ctx = context.borrow();
            if ctx.ports.contains(outport) {
                continue;
            }
            let key = self.bracket_key(
                BracketSide::Out,
                &outport.name,
                ctx.ip.scope.as_deref(),
                outport.index,
            );
            if let Some(out_context) = store.get(&key, position) {
                let out_context = out_context.borrow();
                if out_context.ip.data == ctx.ip.data && out_context.ports.contains(outport) {
                    continue;
                }
            }
            forwardable.push(context.clone());
        }
        forwardable
    }

    /// Close brackets for a finished context, one per outport it reached
    fn closing_packets(&self, context: &ContextRef, case: &str) -> Vec<(PortRef, Packet)> {
        let (ports, close_ip, source) = {
            let ctx = context.borrow();
            (ctx.ports.clone(), ctx.close_ip.clone(), ctx.source.clone())
        };
        let Some(close_ip) = close_ip else {
            return Vec::new();
        };
        debug!(
            target: "rflow::component::brackets",
            "{} closeBracket-{} from '{}' to {}: '{}'",
            self.node_id(),
            case,
            source,
            port_list(&ports),
            close_ip.data
        );
        let mut closes = Vec::with_capacity(ports.len());
        for port in ports {
            let ip = close_ip.clone_packet();
            let key = self.bracket_key(
                BracketSide::Out,
                &port.name,
                ip.scope.as_deref(),
                port.index,
            );
            self.bracket_context.borrow_mut().pop(&key);
            closes.push((port, ip));
        }
        closes
    }

    /// Wrap a result's output in the brackets it inherits from its inputs
    fn add_bracket_forwards(&self, result: &ResultRef) -> Result<()> {
        let mut res = result.borrow_mut();

        let closing_before = std::mem::take(&mut res.bracket_closing_before);
        let mut closes_before = Vec::new();
        for context in &closing_before {
            closes_before.extend(self.closing_packets(context, "A"));
        }

        let bracket_context = std::mem::take(&mut res.bracket_context);
        for (inport, contexts) in bracket_context.iter().rev() {
            if contexts.is_empty() {
                continue;
            }
            let outports: Vec<String> = res.outputs.keys().cloned().collect();
            for outport in outports {
                // Slots that only receive brackets don't get forwarded ones
                let targets: Vec<PortRef> = match res.outputs.get(&outport) {
                    Some(PortOutput::Indexed(map)) => map
                        .iter()
                        .filter(|(_, ips)| ips.iter().any(Packet::is_data))
                        .map(|(idx, _)| PortRef::indexed(outport.clone(), *idx))
                        .collect(),
                    Some(PortOutput::Single(ips)) if ips.iter().any(Packet::is_data) => {
                        vec![PortRef::new(outport.clone())]
                    }
                    _ => Vec::new(),
                };
                for target in targets {
                    let unforwarded = self.forwardable_contexts(inport, &target, contexts);
                    let mut opens = Vec::with_capacity(unforwarded.len());
                    for context in &unforwarded {
                        let key = {
                            let mut ctx = context.borrow_mut();
                            debug!(
                                target: "rflow::component::brackets",
                                "{} openBracket from '{}' to '{}': '{}'",
                                self.node_id(),
                                inport,
                                target,
                                ctx.ip.data
                            );
                            let mut open = ctx.ip.clone_packet();
                            if target.index.is_some() {
                                open.index = target.index;
                            }
                            opens.push(open);
                            ctx.ports.push(target.clone());
                            self.bracket_key(
                                BracketSide::Out,
                                &target.name,
                                ctx.ip.scope.as_deref(),
                                target.index,
                            )
                        };
                        self.bracket_context
                            .borrow_mut()
                            .push(key, context.clone());
                    }
                    for open in opens.into_iter().rev() {
                        self.add_to_result(&mut res, &target, open, true)?;
                    }
                }
            }
        }

        // Closes of earlier streams go ahead of the opens of this one
        for (port, ip) in closes_before.into_iter().rev() {
            self.add_to_result(&mut res, &port, ip, true)?;
        }

        let closing_after = std::mem::take(&mut res.bracket_closing_after);
        for context in &closing_after {
            for (port, ip) in self.closing_packets(context, "B") {
                self.add_to_result(&mut res, &port, ip, false)?;
            }
        }
        Ok(())
    }

    /// Deliver resolved results from the head of the output queue
    pub(crate) fn process_output_queue(&self) -> Result<()> {
        loop {
            let head = {
                let mut queue = self.output_q.borrow_mut();
                let ready = queue
                    .front()
                    .map_or(false, |result| result.borrow().resolved);
                if ready {
                    queue.pop_front()
                } else {
                    None
                }
            };
            let Some(result) = head else {
                return Ok(());
            };
            self.add_bracket_forwards(&result)?;
            let outputs = std::mem::take(&mut result.borrow_mut().outputs);
            for (name, output) in outputs {
                let Some(port) = self.out_ports.get(&name).cloned() else {
                    continue;
                };
                match output {
                    PortOutput::Indexed(map) => {
                        for (idx, ips) in map {
                            if !port.is_attached(Some(idx)) {
                                continue;
                            }
                            for ip in ips {
                                self.send_queued(&port, ip)?;
                            }
                        }
                    }
                    PortOutput::Single(ips) => {
                        if !port.is_attached(None) {
                            continue;
                        }
                        for ip in ips {
                            self.send_queued(&port, ip)?;
                        }
                    }
                }
            }
        }
    }

    fn send_queued(&self, port: &OutPort, mut ip: Packet) -> Result<()> {
        if !port.is_scoped() {
            ip.scope = None;
        }
        let label = match ip.index {
            Some(idx) if port.is_addressable() => format!("{}[{}]", port.name(), idx),
            _ => port.name(),
        };
        debug!(
            target: "rflow::component::send",
            "{} sending {:?} to '{}': {}",
            self.node_id(),
            ip.kind,
            label,
            ip.data
        );
        port.send_ip(ip)
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("node_id", &self.node_id())
            .field("in_ports", &self.in_ports.keys().collect::<Vec<_>>())
            .field("out_ports", &self.out_ports.keys().collect::<Vec<_>>())
            .field("ordered", &self.is_ordered())
            .field("load", &self.load.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connections::{Socket, SocketEvent};
    use serde_json::json;

    fn capture(port: &OutPort) -> Rc<RefCell<Vec<String>>> {
        let socket = Socket::new(Value::Null);
        port.attach(&socket, None).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        socket.events().subscribe("ip", move |event| {
            if let SocketEvent::Ip(ip) = event {
                let entry = match ip.kind {
                    PacketKind::OpenBracket => format!("< {}", ip.data),
                    PacketKind::Data => format!("{}", ip.data),
                    PacketKind::CloseBracket => format!("> {}", ip.data),
                };
                sink.borrow_mut().push(entry);
            }
        });
        seen
    }

    fn uppercase() -> Rc<Component> {
        Component::new(
            ComponentConfig::new()
                .inport("in", InPortConfig::typed("string"))
                .outport("out", OutPortConfig::typed("string"))
                .process(|input, output| {
                    if !input.has_data(&["in"])? {
                        return Ok(());
                    }
                    let data = input.get_data("in")?.unwrap_or_default();
                    let text = data.as_str().unwrap_or_default().to_uppercase();
                    output.send_done("out", text)
                }),
        )
        .unwrap()
    }

    #[test]
    fn test_default_forwarding_is_pruned() {
        let component = uppercase();
        assert!(component.is_forwarding_inport("in"));
        assert!(component.is_forwarding_outport("in", "out"));
        assert!(!component.is_forwarding_outport("in", "error"));

        let bare = Component::new(ComponentConfig::new().inport("data", InPortConfig::new())).unwrap();
        assert!(bare.is_forwarding_inport("in"));
    }

    #[test]
    fn test_bracket_stream_is_forwarded() {
        let component = uppercase();
        let seen = capture(component.out_port("out").unwrap());
        let port = component.in_port("in").unwrap();
        port.handle_ip(Packet::open_bracket("a"), 0).unwrap();
        port.handle_ip(Packet::data("x"), 0).unwrap();
        port.handle_ip(Packet::close_bracket("a"), 0).unwrap();
        assert_eq!(*seen.borrow(), vec!["< \"a\"", "\"X\"", "> \"a\""]);
        assert!(component.is_ordered());
        assert_eq!(component.load(), 0);
        assert_eq!(component.output_queue_len(), 0);
        assert_eq!(component.bracket_depth(BracketSide::In, "in", None, None), 0);
        assert_eq!(component.bracket_depth(BracketSide::Out, "out", None, None), 0);
    }

    #[test]
    fn test_nested_brackets_close_in_order() {
        let component = uppercase();
        let seen = capture(component.out_port("out").unwrap());
        let port = component.in_port("in").unwrap();
        for packet in [
            Packet::open_bracket("outer"),
            Packet::open_bracket("inner"),
            Packet::data("x"),
            Packet::close_bracket("inner"),
            Packet::data("y"),
            Packet::close_bracket("outer"),
        ] {
            port.handle_ip(packet, 0).unwrap();
        }
        assert_eq!(
            *seen.borrow(),
            vec![
                "< \"outer\"",
                "< \"inner\"",
                "\"X\"",
                "> \"inner\"",
                "\"Y\"",
                "> \"outer\""
            ]
        );
    }

    #[test]
    fn test_auto_ordering_can_be_disabled() {
        let component = Component::new(
            ComponentConfig::new()
                .inport("in", InPortConfig::new())
                .outport("out", OutPortConfig::new())
                .auto_ordering(false)
                .process(|input, output| {
                    let data = input.get_data("in")?;
                    output.send_done("out", data.unwrap_or_default())
                }),
        )
        .unwrap();
        let port = component.in_port("in").unwrap();
        port.handle_ip(Packet::open_bracket("a"), 0).unwrap();
        assert!(!component.is_ordered());
    }

    #[test]
    fn test_error_port_routing() {
        let component = Component::new(
            ComponentConfig::new()
                .inport("in", InPortConfig::new())
                .outport("out", OutPortConfig::new())
                .outport("error", OutPortConfig::new())
                .process(|input, _output| {
                    input.get_data("in")?;
                    Err(FlowError::component("bad input"))
                }),
        )
        .unwrap();
        let errors = capture(component.out_port("error").unwrap());
        component
            .in_port("in")
            .unwrap()
            .handle_ip(Packet::data(1), 0)
            .unwrap();
        assert_eq!(*errors.borrow(), vec!["\"bad input\""]);
        assert_eq!(component.load(), 0);
    }

    #[test]
    fn test_error_without_port_is_returned() {
        let component = Component::new(
            ComponentConfig::new()
                .inport("in", InPortConfig::new())
                .process(|_input, _output| Err(FlowError::component("boom"))),
        )
        .unwrap();
        let err = component
            .in_port("in")
            .unwrap()
            .handle_ip(Packet::data(1), 0)
            .unwrap_err();
        assert!(matches!(err, FlowError::Component(msg) if msg == "boom"));
        assert_eq!(component.load(), 0);
    }

    #[test]
    fn test_required_unattached_error_port_fails_loudly() {
        let component = Component::new(
            ComponentConfig::new()
                .inport("in", InPortConfig::new())
                .outport("error", OutPortConfig::new().required()),
        )
        .unwrap();
        let err = component
            .error(FlowError::component("lost"), &[], None, None)
            .unwrap_err();
        assert_eq!(err.to_string(), "lost");
    }

    #[test]
    fn test_component_error_brackets_groups() {
        let component = Component::new(
            ComponentConfig::new().outport("error", OutPortConfig::new()),
        )
        .unwrap();
        let seen = capture(component.out_port("error").unwrap());
        component
            .error(
                FlowError::component("bad"),
                &[json!("req"), json!("item")],
                None,
                None,
            )
            .unwrap();
        assert_eq!(
            *seen.borrow(),
            vec!["< \"req\"", "< \"item\"", "\"bad\"", "> \"item\"", "> \"req\""]
        );
    }

    #[test]
    fn test_lifecycle_hooks_and_events() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let setup_log = log.clone();
        let teardown_log = log.clone();
        let component = Component::new(
            ComponentConfig::new()
                .inport("in", InPortConfig::new())
                .setup(move |_| {
                    setup_log.borrow_mut().push("setup");
                    Ok(())
                })
                .teardown(move |_| {
                    teardown_log.borrow_mut().push("teardown");
                    Ok(())
                }),
        )
        .unwrap();
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        component.events().subscribe_all(move |event| {
            sink.borrow_mut().push(event.clone());
        });

        component.start().unwrap();
        assert!(component.is_started());
        component
            .in_port("in")
            .unwrap()
            .handle_ip(Packet::data(1), 0)
            .ok();
        let finished = Rc::new(Cell::new(false));
        let flag = finished.clone();
        component
            .shutdown(move || {
                flag.set(true);
                Ok(())
            })
            .unwrap();
        assert!(finished.get());
        assert!(!component.is_started());
        assert_eq!(component.in_port("in").unwrap().length(None, None), 0);
        assert_eq!(*log.borrow(), vec!["setup", "teardown"]);
        assert_eq!(*events.borrow(), vec![ComponentEvent::Start, ComponentEvent::End]);
    }

    #[test]
    fn test_failing_setup_is_lifecycle_error() {
        let component = Component::new(
            ComponentConfig::new().setup(|_| Err(FlowError::component("no db"))),
        )
        .unwrap();
        component.set_node_id("Store");
        let err = component.start().unwrap_err();
        assert_eq!(err.to_string(), "lifecycle hook of `Store` failed: no db");
        assert!(!component.is_started());
    }

    #[test]
    fn test_icon_change_is_emitted() {
        let component = Component::new(ComponentConfig::new().icon("cog")).unwrap();
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        component.events().subscribe("icon", move |event| {
            if let ComponentEvent::Icon(icon) = event {
                *sink.borrow_mut() = Some(icon.clone());
            }
        });
        component.set_icon("gear");
        assert_eq!(component.icon().as_deref(), Some("gear"));
        assert_eq!(seen.borrow().as_deref(), Some("gear"));
    }
}
