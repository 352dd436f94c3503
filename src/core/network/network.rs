use super::graph::{Graph, GraphEdge, GraphInitial, GraphNode};
use crate::core::components::{Component, ComponentEvent, ComponentLoader, LoadContext};
use crate::core::config::NetworkConfig;
use crate::core::connections::{Socket, SocketEnd, SocketEvent};
use crate::core::errors::{FlowError, PortDirection, ProcessFailure, Result};
use crate::core::events::{ListenerId, Subject, Topic};
use crate::core::ports::{InPort, Port};
use crate::core::scheduler::{Scheduler, TaskId};
use crate::core::values::{Packet, PacketKind};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, info, warn};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use uuid::Uuid;

/// A node instantiated in a network
#[derive(Debug, Clone)]
pub struct NetworkProcess {
    pub id: String,
    pub component_name: Option<String>,
    pub component: Option<Rc<Component>>,
    pub metadata: Value,
    listeners: Vec<ListenerId>,
}

/// A packet that crossed one of the network's sockets
#[derive(Debug, Clone)]
pub struct IpEvent {
    /// Socket identifier, `A() OUT -> IN B()`
    pub id: String,
    pub kind: PacketKind,
    pub data: Value,
    pub scope: Option<String>,
    pub index: Option<usize>,
    /// Edge metadata
    pub metadata: Value,
    /// Subgraph node ids the packet travelled inside, outermost first
    pub subgraph: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum NetworkEvent {
    Start {
        start: DateTime<Utc>,
    },
    End {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        /// Milliseconds between start and end
        uptime: i64,
    },
    Ip(IpEvent),
    ProcessError(ProcessFailure),
    Icon {
        id: String,
        icon: String,
    },
}

impl Topic for NetworkEvent {
    fn topic(&self) -> &'static str {
        match self {
            NetworkEvent::Start { .. } => "start",
            NetworkEvent::End { .. } => "end",
            NetworkEvent::Ip(_) => "ip",
            NetworkEvent::ProcessError(_) => "process-error",
            NetworkEvent::Icon { .. } => "icon",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Uninitialized,
    Connecting,
    /// Connected, not running
    Idle,
    Running,
    Stopping,
    Destroyed,
}

#[derive(Clone)]
struct InitialPacket {
    socket: Rc<Socket>,
    data: Value,
}

type ParentSink = Rc<dyn Fn(ProcessFailure) -> Result<()>>;

/// Running instance of a graph.
///
/// Owns the processes and the sockets between them, delivers initial packets
/// and defaults on start, and detects termination by watching the aggregate
/// load of its processes.
pub struct Network {
    self_ref: Weak<Network>,
    id: Uuid,
    graph: Graph,
    loader: Rc<dyn ComponentLoader>,
    scheduler: Scheduler,
    config: NetworkConfig,
    processes: RefCell<IndexMap<String, NetworkProcess>>,
    connections: RefCell<Vec<Rc<Socket>>>,
    /// Initial packets still to be sent in the current run
    initials: RefCell<Vec<InitialPacket>>,
    /// Initial packets to send on every start
    next_initials: RefCell<Vec<InitialPacket>>,
    defaults: RefCell<Vec<Rc<Socket>>>,
    event_buffer: RefCell<Vec<NetworkEvent>>,
    started: Cell<bool>,
    stopped: Cell<bool>,
    stopping: Cell<bool>,
    restart_pending: Cell<bool>,
    destroyed: Cell<bool>,
    connecting: Cell<bool>,
    connected: Cell<bool>,
    startup_date: Cell<Option<DateTime<Utc>>>,
    debounce: Cell<Option<TaskId>>,
    abort_debounce: Cell<bool>,
    /// Set on nested networks: failures go to the parent network
    parent_sink: RefCell<Option<ParentSink>>,
    events: Subject<NetworkEvent>,
}

impl Network {
    pub fn new(
        graph: Graph,
        loader: Rc<dyn ComponentLoader>,
        scheduler: Scheduler,
        config: NetworkConfig,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            id: Uuid::new_v4(),
            graph,
            loader,
            scheduler,
            config,
            processes: RefCell::new(IndexMap::new()),
            connections: RefCell::new(Vec::new()),
            initials: RefCell::new(Vec::new()),
            next_initials: RefCell::new(Vec::new()),
            defaults: RefCell::new(Vec::new()),
            event_buffer: RefCell::new(Vec::new()),
            started: Cell::new(false),
            stopped: Cell::new(true),
            stopping: Cell::new(false),
            restart_pending: Cell::new(false),
            destroyed: Cell::new(false),
            connecting: Cell::new(false),
            connected: Cell::new(false),
            startup_date: Cell::new(None),
            debounce: Cell::new(None),
            abort_debounce: Cell::new(false),
            parent_sink: RefCell::new(None),
            events: Subject::new(),
        })
    }

    /// Instantiate a graph and wire it up
    pub fn create(
        graph: Graph,
        loader: Rc<dyn ComponentLoader>,
        scheduler: Scheduler,
        config: NetworkConfig,
    ) -> Result<Rc<Self>> {
        let network = Self::new(graph, loader, scheduler, config);
        network.connect()?;
        Ok(network)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn events(&self) -> &Subject<NetworkEvent> {
        &self.events
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed.get() {
            return Err(FlowError::InvalidState(format!(
                "network '{}' has been destroyed",
                self.graph.name
            )));
        }
        Ok(())
    }

    pub fn processes(&self) -> Vec<NetworkProcess> {
        self.processes.borrow().values().cloned().collect()
    }

    pub fn get_node(&self, id: &str) -> Option<NetworkProcess> {
        self.processes.borrow().get(id).cloned()
    }

    /// Component of a node
    pub fn component(&self, id: &str) -> Result<Rc<Component>> {
        let processes = self.processes.borrow();
        let process = processes
            .get(id)
            .ok_or_else(|| FlowError::node_not_found(id))?;
        process
            .component
            .clone()
            .ok_or_else(|| FlowError::no_component(id))
    }

    fn components(&self) -> Vec<Rc<Component>> {
        self.processes
            .borrow()
            .values()
            .filter_map(|process| process.component.clone())
            .collect()
    }

    pub fn connections(&self) -> Vec<Rc<Socket>> {
        self.connections.borrow().clone()
    }

    /// Ids of processes with activations in flight
    pub fn get_active_processes(&self) -> Vec<String> {
        self.processes
            .borrow()
            .values()
            .filter(|process| process.component.as_ref().map_or(false, |c| c.load() > 0))
            .map(|process| process.id.clone())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        !self.get_active_processes().is_empty()
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }

    pub fn state(&self) -> NetworkState {
        if self.destroyed.get() {
            NetworkState::Destroyed
        } else if self.connecting.get() {
            NetworkState::Connecting
        } else if self.stopping.get() {
            NetworkState::Stopping
        } else if self.started.get() {
            NetworkState::Running
        } else if self.connected.get() {
            NetworkState::Idle
        } else {
            NetworkState::Uninitialized
        }
    }

    /// Milliseconds since the network was started
    pub fn uptime(&self) -> i64 {
        self.startup_date
            .get()
            .map_or(0, |start| (Utc::now() - start).num_milliseconds())
    }

    fn load_context(&self, metadata: Value) -> LoadContext {
        LoadContext {
            scheduler: self.scheduler.clone(),
            loader: self.loader.clone(),
            metadata,
            config: self.config.clone(),
        }
    }

    /// Instantiate a node. Adding an id twice returns the existing process.
    pub fn add_node(&self, node: &GraphNode) -> Result<NetworkProcess> {
        self.ensure_alive()?;
        if let Some(existing) = self.get_node(&node.id) {
            return Ok(existing);
        }
        let mut process = NetworkProcess {
            id: node.id.clone(),
            component_name: node.component.clone(),
            component: None,
            metadata: node.metadata.clone(),
            listeners: Vec::new(),
        };
        if let Some(name) = &node.component {
            let component = self
                .loader
                .load(name, &self.load_context(node.metadata.clone()))?;
            component.set_node_id(&node.id);
            if let Some(nested) = component.subgraph_network() {
                self.subscribe_subgraph(&component, nested);
            }
            process.listeners = self.subscribe_node(&component);
            process.component = Some(component);
            debug!(target: "rflow::network", "added node '{}' ({})", node.id, name);
        } else {
            debug!(target: "rflow::network", "added node '{}' without component", node.id);
        }
        self.processes
            .borrow_mut()
            .insert(node.id.clone(), process.clone());
        Ok(process)
    }

    fn subscribe_subgraph(&self, component: &Rc<Component>, nested: &Rc<Network>) {
        let parent = self.self_ref.clone();
        let node = Rc::downgrade(component);
        nested.events().subscribe("ip", move |event| {
            let (Some(parent), Some(node)) = (parent.upgrade(), node.upgrade()) else {
                return;
            };
            if let NetworkEvent::Ip(ip) = event {
                let mut ip = ip.clone();
                ip.subgraph.insert(0, node.node_id());
                parent.buffered_emit(NetworkEvent::Ip(ip));
            }
        });

        let parent = self.self_ref.clone();
        let node = Rc::downgrade(component);
        nested.set_parent_sink(Some(Rc::new(move |mut failure: ProcessFailure| {
            if let Some(node) = node.upgrade() {
                failure.subgraph.insert(0, node.node_id());
            }
            match parent.upgrade() {
                Some(parent) => parent.handle_process_error(failure),
                None => Err(FlowError::Process(failure)),
            }
        })));
    }

    fn subscribe_node(&self, component: &Rc<Component>) -> Vec<ListenerId> {
        let events = component.events();
        let network = self.self_ref.clone();
        let node = Rc::downgrade(component);
        let icon = events.subscribe("icon", move |event| {
            let (Some(network), Some(node)) = (network.upgrade(), node.upgrade()) else {
                return;
            };
            if let ComponentEvent::Icon(icon) = event {
                network.buffered_emit(NetworkEvent::Icon {
                    id: node.node_id(),
                    icon: icon.clone(),
                });
            }
        });

        let network = self.self_ref.clone();
        let activate = events.subscribe("activate", move |_| {
            if let Some(network) = network.upgrade() {
                if network.debounce.get().is_some() {
                    network.abort_debounce.set(true);
                }
            }
        });

        let network = self.self_ref.clone();
        let deactivate = events.subscribe("deactivate", move |event| {
            if let (ComponentEvent::Deactivate(0), Some(network)) = (event, network.upgrade()) {
                network.check_if_finished();
            }
        });
        vec![icon, activate, deactivate]
    }

    /// Remove a node once its in-flight activations have finished
    pub fn remove_node(&self, id: &str) -> Result<()> {
        self.ensure_alive()?;
        let process = self
            .get_node(id)
            .ok_or_else(|| FlowError::node_not_found(id))?;
        let Some(component) = process.component else {
            self.processes.borrow_mut().shift_remove(id);
            return Ok(());
        };
        let network = self.self_ref.clone();
        let target = Rc::downgrade(&component);
        component.shutdown(move || {
            if let (Some(network), Some(target)) = (network.upgrade(), target.upgrade()) {
                network.forget_process(&target);
            }
            Ok(())
        })
    }

    fn forget_process(&self, component: &Rc<Component>) {
        let removed = {
            let mut processes = self.processes.borrow_mut();
            let id = processes.iter().find_map(|(id, process)| {
                process
                    .component
                    .as_ref()
                    .filter(|c| Rc::ptr_eq(c, component))
                    .map(|_| id.clone())
            });
            id.and_then(|id| processes.shift_remove(&id))
        };
        if let Some(process) = removed {
            for listener in process.listeners {
                component.events().unsubscribe(listener);
            }
            debug!(target: "rflow::network", "removed node '{}'", process.id);
        }
    }

    pub fn rename_node(&self, old: &str, new: &str) -> Result<()> {
        self.ensure_alive()?;
        {
            let mut processes = self.processes.borrow_mut();
            let mut process = processes
                .shift_remove(old)
                .ok_or_else(|| FlowError::node_not_found(old))?;
            process.id = new.to_string();
            if let Some(component) = &process.component {
                component.set_node_id(new);
            }
            processes.insert(new.to_string(), process);
        }
        for socket in self.connections() {
            socket.rename_node(old, new);
        }
        Ok(())
    }

    fn subscribe_socket(&self, socket: &Rc<Socket>) {
        let network = self.self_ref.clone();
        let source = Rc::downgrade(socket);
        socket.events().subscribe("ip", move |event| {
            let (Some(network), Some(socket)) = (network.upgrade(), source.upgrade()) else {
                return;
            };
            if let SocketEvent::Ip(ip) = event {
                network.buffered_emit(NetworkEvent::Ip(IpEvent {
                    id: socket.id(),
                    kind: ip.kind,
                    data: ip.data.clone(),
                    scope: ip.scope.clone(),
                    index: ip.index,
                    metadata: socket.metadata().clone(),
                    subgraph: Vec::new(),
                }));
            }
        });

        let network = self.self_ref.clone();
        socket.set_error_handler(Some(Rc::new(move |err| match err {
            FlowError::Process(failure) => match network.upgrade() {
                Some(network) => network.handle_process_error(failure),
                None => Err(FlowError::Process(failure)),
            },
            other => Err(other),
        })));
        socket.set_debug(self.config.debug);
    }

    /// Route a captured component failure: to the parent network for nested
    /// networks, else to `process-error` listeners. With no listener the
    /// failure is returned to the sender.
    pub(crate) fn handle_process_error(&self, failure: ProcessFailure) -> Result<()> {
        let sink = self.parent_sink.borrow().clone();
        if let Some(sink) = sink {
            return sink(failure);
        }
        if self.events.listener_count("process-error") == 0 {
            return Err(FlowError::Process(failure));
        }
        warn!(target: "rflow::network", "{}", failure);
        self.buffered_emit(NetworkEvent::ProcessError(failure));
        Ok(())
    }

    pub(crate) fn set_parent_sink(&self, sink: Option<ParentSink>) {
        *self.parent_sink.borrow_mut() = sink;
    }

    fn in_port_of(&self, node: &str, port: &str) -> Result<(Rc<Component>, Rc<InPort>)> {
        let component = self.component(node)?;
        let in_port = component
            .in_port(port)
            .cloned()
            .ok_or_else(|| FlowError::port_not_found(node, port, PortDirection::In))?;
        Ok((component, in_port))
    }

    /// Wire an edge between two processes
    pub fn add_edge(&self, edge: &GraphEdge) -> Result<Rc<Socket>> {
        self.ensure_alive()?;
        let from = self.component(&edge.from.node)?;
        let (_, in_port) = self.in_port_of(&edge.to.node, &edge.to.port)?;
        let out_port = from.out_port(&edge.from.port).cloned().ok_or_else(|| {
            FlowError::port_not_found(&edge.from.node, &edge.from.port, PortDirection::Out)
        })?;

        let socket = Socket::new(edge.metadata.clone());
        socket.set_from(Some(SocketEnd::new(
            &edge.from.node,
            &edge.from.port,
            edge.from.index,
        )));
        socket.set_to(Some(SocketEnd::new(&edge.to.node, &edge.to.port, edge.to.index)));
        self.subscribe_socket(&socket);

        in_port.attach(&socket, edge.to.index);
        self.connections.borrow_mut().push(socket.clone());
        out_port.attach(&socket, edge.from.index)?;
        debug!(target: "rflow::network", "connected {}", socket.id());
        Ok(socket)
    }

    fn detach(&self, socket: &Rc<Socket>) {
        if let Some(to) = socket.to() {
            if let Ok((_, port)) = self.in_port_of(&to.node, &to.port) {
                port.detach_socket(socket);
            }
        }
        if let Some(from) = socket.from() {
            if let Ok(component) = self.component(&from.node) {
                if let Some(port) = component.out_port(&from.port) {
                    port.detach(socket);
                }
            }
        }
        socket.disconnect();
    }

    fn forget_sockets(&self, sockets: &[Rc<Socket>]) {
        let owned = |socket: &Rc<Socket>| sockets.iter().any(|s| Rc::ptr_eq(s, socket));
        self.connections.borrow_mut().retain(|s| !owned(s));
        self.initials.borrow_mut().retain(|i| !owned(&i.socket));
        self.next_initials.borrow_mut().retain(|i| !owned(&i.socket));
        self.defaults.borrow_mut().retain(|s| !owned(s));
    }

    /// Remove the sockets wiring `edge.from` to `edge.to`
    pub fn remove_edge(&self, edge: &GraphEdge) -> Result<()> {
        self.ensure_alive()?;
        let ends_match = |end: Option<SocketEnd>, node: &str, port: &str| {
            end.map_or(false, |end| end.node == node && end.port == port)
        };
        let matching: Vec<Rc<Socket>> = self
            .connections()
            .into_iter()
            .filter(|socket| {
                ends_match(socket.to(), &edge.to.node, &edge.to.port)
                    && ends_match(socket.from(), &edge.from.node, &edge.from.port)
            })
            .collect();
        if matching.is_empty() {
            return Err(FlowError::EdgeNotFound {
                node: edge.to.node.clone(),
                port: edge.to.port.clone(),
            });
        }
        for socket in &matching {
            self.detach(socket);
        }
        self.forget_sockets(&matching);
        Ok(())
    }

    /// Attach an initial packet to a port. While the network runs it is sent
    /// right away; a finished but not stopped network starts again.
    pub fn add_initial(&self, initial: &GraphInitial) -> Result<Rc<Socket>> {
        self.ensure_alive()?;
        let (_, port) = self.in_port_of(&initial.to.node, &initial.to.port)?;
        let socket = Socket::new(initial.metadata.clone());
        socket.set_to(Some(SocketEnd::new(
            &initial.to.node,
            &initial.to.port,
            initial.to.index,
        )));
        self.subscribe_socket(&socket);
        port.attach(&socket, initial.to.index);
        self.connections.borrow_mut().push(socket.clone());

        let packet = InitialPacket {
            socket: socket.clone(),
            data: initial.data.clone(),
        };
        self.initials.borrow_mut().push(packet.clone());
        self.next_initials.borrow_mut().push(packet);

        if self.is_running() {
            self.schedule_initials();
        } else if !self.is_stopped() {
            self.set_started(true);
            self.schedule_initials();
        }
        Ok(socket)
    }

    /// Remove the initial packets attached to a port
    pub fn remove_initial(&self, node: &str, port: &str) -> Result<()> {
        self.ensure_alive()?;
        let matching: Vec<Rc<Socket>> = self
            .next_initials
            .borrow()
            .iter()
            .map(|initial| initial.socket.clone())
            .filter(|socket| {
                socket
                    .to()
                    .map_or(false, |end| end.node == node && end.port == port)
            })
            .collect();
        if matching.is_empty() {
            return Err(FlowError::EdgeNotFound {
                node: node.to_string(),
                port: port.to_string(),
            });
        }
        for socket in &matching {
            self.detach(socket);
        }
        self.forget_sockets(&matching);
        Ok(())
    }

    fn schedule_initials(&self) {
        let network = self.self_ref.clone();
        self.scheduler.defer(move || match network.upgrade() {
            Some(network) => network.send_initials(),
            None => Ok(()),
        });
    }

    fn send_initials(&self) -> Result<()> {
        let initials = std::mem::take(&mut *self.initials.borrow_mut());
        for initial in initials {
            initial
                .socket
                .post(Some(Packet::initial(initial.data)), true)?;
        }
        Ok(())
    }

    /// Attach default-value sockets to every unconnected inport of a node
    /// that declares a default
    pub fn add_defaults(&self, node: &str) -> Result<()> {
        self.ensure_alive()?;
        let component = self.component(node)?;
        for (name, port) in component.in_ports() {
            if !port.has_default() || port.is_attached(None) {
                continue;
            }
            let socket = Socket::new(Value::Null);
            socket.set_to(Some(SocketEnd::new(node, name, None)));
            self.subscribe_socket(&socket);
            port.attach(&socket, None);
            self.connections.borrow_mut().push(socket.clone());
            self.defaults.borrow_mut().push(socket);
        }
        Ok(())
    }

    fn send_defaults(&self) -> Result<()> {
        let defaults = self.defaults.borrow().clone();
        for socket in defaults {
            let Some(to) = socket.to() else {
                continue;
            };
            let Ok((_, port)) = self.in_port_of(&to.node, &to.port) else {
                continue;
            };
            // A real edge attached later takes over from the default
            if port.socket_count() != 1 {
                continue;
            }
            socket.send_default()?;
        }
        Ok(())
    }

    /// Instantiate nodes, then wire edges, initial packets and defaults
    pub fn connect(&self) -> Result<()> {
        self.ensure_alive()?;
        self.connecting.set(true);
        let connected = self.connect_graph();
        self.connecting.set(false);
        if connected.is_ok() {
            self.connected.set(true);
            info!(
                target: "rflow::network",
                "network '{}' connected: {} processes, {} sockets",
                self.graph.name,
                self.processes.borrow().len(),
                self.connections.borrow().len()
            );
        }
        connected
    }

    fn connect_graph(&self) -> Result<()> {
        for node in &self.graph.nodes {
            self.add_node(node)?;
        }
        for edge in &self.graph.edges {
            self.add_edge(edge)?;
        }
        for initial in &self.graph.initializers {
            self.add_initial(initial)?;
        }
        let wired: Vec<String> = self
            .processes
            .borrow()
            .values()
            .filter(|process| process.component.is_some())
            .map(|process| process.id.clone())
            .collect();
        for node in wired {
            self.add_defaults(&node)?;
        }
        Ok(())
    }

    fn abort_pending_end(&self) {
        if let Some(id) = self.debounce.take() {
            self.scheduler.cancel(id);
        }
    }

    /// Start every process, then send initial packets and defaults.
    /// Starting a running network restarts it.
    pub fn start(&self) -> Result<()> {
        self.ensure_alive()?;
        self.abort_pending_end();
        if self.is_started() {
            self.restart_pending.set(true);
            return self.stop();
        }
        *self.initials.borrow_mut() = self.next_initials.borrow().clone();
        self.event_buffer.borrow_mut().clear();
        self.startup_date.set(None);

        for component in self.components() {
            component.start()?;
        }
        self.send_initials()?;
        self.send_defaults()?;
        self.set_started(true);
        info!(target: "rflow::network", "network '{}' started", self.graph.name);
        // Networks whose work completed synchronously still report end
        self.check_if_finished();
        Ok(())
    }

    /// Disconnect sockets and shut every process down. The network ends once
    /// all in-flight activations have completed.
    pub fn stop(&self) -> Result<()> {
        self.abort_pending_end();
        if !self.is_started() {
            self.stopped.set(true);
            if self.restart_pending.replace(false) {
                return self.start();
            }
            return Ok(());
        }
        if self.stopping.get() {
            return Ok(());
        }
        self.stopping.set(true);
        for socket in self.connections() {
            if socket.is_connected() {
                socket.disconnect();
            }
        }

        let components = self.components();
        if components.is_empty() {
            return self.finish_stop();
        }
        let remaining = Rc::new(Cell::new(components.len()));
        for component in components {
            let network = self.self_ref.clone();
            let remaining = remaining.clone();
            let shutdown = component.shutdown(move || {
                remaining.set(remaining.get() - 1);
                match network.upgrade() {
                    Some(network) if remaining.get() == 0 => network.finish_stop(),
                    _ => Ok(()),
                }
            });
            if let Err(err) = shutdown {
                self.stopping.set(false);
                return Err(err);
            }
        }
        if self.stopping.get() {
            debug!(
                target: "rflow::network",
                "network '{}' waiting for {:?} to finish",
                self.graph.name,
                self.get_active_processes()
            );
        }
        Ok(())
    }

    fn finish_stop(&self) -> Result<()> {
        self.stopping.set(false);
        self.set_started(false);
        self.stopped.set(true);
        info!(target: "rflow::network", "network '{}' stopped", self.graph.name);
        if self.restart_pending.replace(false) {
            return self.start();
        }
        Ok(())
    }

    /// Stop the network and remove every node and socket. Terminal.
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.get() {
            return Ok(());
        }
        self.stop()?;
        let sockets = self.connections();
        for socket in &sockets {
            self.detach(socket);
        }
        self.forget_sockets(&sockets);
        let processes = std::mem::take(&mut *self.processes.borrow_mut());
        for process in processes.into_values() {
            if let Some(component) = process.component {
                for listener in process.listeners {
                    component.events().unsubscribe(listener);
                }
            }
        }
        self.initials.borrow_mut().clear();
        self.next_initials.borrow_mut().clear();
        self.defaults.borrow_mut().clear();
        self.destroyed.set(true);
        info!(target: "rflow::network", "network '{}' destroyed", self.graph.name);
        Ok(())
    }

    fn set_started(&self, started: bool) {
        if self.started.get() == started {
            return;
        }
        if !started {
            self.started.set(false);
            let end = Utc::now();
            let start = self.startup_date.get().unwrap_or(end);
            self.buffered_emit(NetworkEvent::End {
                start,
                end,
                uptime: (end - start).num_milliseconds(),
            });
            return;
        }
        let start = match self.startup_date.get() {
            Some(start) => start,
            None => {
                let now = Utc::now();
                self.startup_date.set(Some(now));
                now
            }
        };
        self.started.set(true);
        self.stopped.set(false);
        self.buffered_emit(NetworkEvent::Start { start });
    }

    /// Schedule the end notification once aggregate load stays at zero for
    /// the debounce window
    fn check_if_finished(&self) {
        if self.is_running() {
            return;
        }
        self.abort_debounce.set(false);
        self.abort_pending_end();
        let network = self.self_ref.clone();
        let id = self.scheduler.schedule(self.config.debounce_ms, move || {
            let Some(network) = network.upgrade() else {
                return Ok(());
            };
            network.debounce.set(None);
            if network.abort_debounce.get() || network.is_running() {
                return Ok(());
            }
            network.set_started(false);
            Ok(())
        });
        self.debounce.set(Some(id));
    }

    /// Emit an event; packet events raised before `start` are held back and
    /// flushed right after it
    fn buffered_emit(&self, event: NetworkEvent) {
        let immediate = matches!(
            event,
            NetworkEvent::Icon { .. } | NetworkEvent::ProcessError(_) | NetworkEvent::End { .. }
        );
        if immediate {
            self.events.emit(&event);
            return;
        }
        if !self.is_started() {
            self.event_buffer.borrow_mut().push(event);
            return;
        }
        self.events.emit(&event);
        if matches!(event, NetworkEvent::Start { .. }) {
            let buffered = std::mem::take(&mut *self.event_buffer.borrow_mut());
            for event in buffered {
                self.events.emit(&event);
            }
        }
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("id", &self.id)
            .field("graph", &self.graph.name)
            .field("state", &self.state())
            .field("processes", &self.processes.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::components::{ComponentConfig, ComponentRegistry};
    use crate::core::network::EdgeEnd;
    use crate::core::ports::{InPortConfig, OutPortConfig};

    fn registry() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry.register("Pass", |_| {
            Component::new(
                ComponentConfig::new()
                    .inport("in", InPortConfig::new())
                    .outport("out", OutPortConfig::new())
                    .process(|input, output| {
                        let data = input.get_data("in")?.unwrap_or_default();
                        output.send_done("out", data)
                    }),
            )
        });
        registry
    }

    fn network(graph: Graph) -> Result<Rc<Network>> {
        Network::create(
            graph,
            Rc::new(registry()),
            Scheduler::new(),
            NetworkConfig::default(),
        )
    }

    #[test]
    fn test_connect_reports_missing_component() {
        let mut graph = Graph::new("broken");
        graph.add_node("A", "Missing");
        let err = network(graph).unwrap_err();
        assert!(matches!(err, FlowError::ComponentNotFound { .. }));
    }

    #[test]
    fn test_connect_reports_missing_port() {
        let mut graph = Graph::new("broken");
        graph
            .add_node("A", "Pass")
            .add_node("B", "Pass")
            .add_edge("A", "out", "B", "nope");
        let err = network(graph).unwrap_err();
        assert_eq!(err.to_string(), "no inport `nope` defined in process `B`");
    }

    #[test]
    fn test_edge_to_bare_node_fails() {
        let mut graph = Graph::new("broken");
        graph.add_node("A", "Pass");
        graph.nodes.push(GraphNode {
            id: "Bare".to_string(),
            component: None,
            metadata: Value::Null,
        });
        graph.add_edge("A", "out", "Bare", "in");
        let err = network(graph).unwrap_err();
        assert!(matches!(err, FlowError::NoComponent { node } if node == "Bare"));
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let mut graph = Graph::new("g");
        graph.add_node("A", "Pass");
        let network = network(graph).unwrap();
        let first = network.component("A").unwrap();
        let again = network.add_node(&network.graph().nodes[0].clone()).unwrap();
        assert!(Rc::ptr_eq(&first, again.component.as_ref().unwrap()));
        assert_eq!(network.processes().len(), 1);
        assert_eq!(network.state(), NetworkState::Idle);
    }

    #[test]
    fn test_rename_node_updates_sockets() {
        let mut graph = Graph::new("g");
        graph
            .add_node("A", "Pass")
            .add_node("B", "Pass")
            .add_edge("A", "out", "B", "in");
        let network = network(graph).unwrap();
        network.rename_node("A", "Source").unwrap();
        assert!(network.get_node("A").is_none());
        assert_eq!(network.component("Source").unwrap().node_id(), "Source");
        assert_eq!(network.connections()[0].id(), "Source() OUT -> IN B()");
        assert!(network.rename_node("A", "Other").is_err());
    }

    #[test]
    fn test_remove_edge() {
        let mut graph = Graph::new("g");
        graph
            .add_node("A", "Pass")
            .add_node("B", "Pass")
            .add_edge("A", "out", "B", "in");
        let network = network(graph).unwrap();
        let edge = network.graph().edges[0].clone();
        network.remove_edge(&edge).unwrap();
        assert!(network.connections().is_empty());
        assert!(!network.component("A").unwrap().out_port("out").unwrap().is_attached(None));
        let err = network.remove_edge(&edge).unwrap_err();
        assert!(matches!(err, FlowError::EdgeNotFound { .. }));

        let reversed = GraphEdge {
            from: EdgeEnd::new("B", "out"),
            to: EdgeEnd::new("A", "in"),
            metadata: Value::Null,
        };
        assert!(network.remove_edge(&reversed).is_err());
    }

    #[test]
    fn test_remove_initial() {
        let mut graph = Graph::new("g");
        graph.add_node("A", "Pass").add_initial("x", "A", "in");
        let network = network(graph).unwrap();
        assert_eq!(network.connections().len(), 1);
        network.remove_initial("A", "in").unwrap();
        assert!(network.connections().is_empty());
        assert!(network.remove_initial("A", "in").is_err());
    }

    #[test]
    fn test_destroyed_network_rejects_changes() {
        let mut graph = Graph::new("g");
        graph.add_node("A", "Pass");
        let network = network(graph).unwrap();
        network.destroy().unwrap();
        assert_eq!(network.state(), NetworkState::Destroyed);
        assert!(network.processes().is_empty());
        assert!(matches!(
            network.start().unwrap_err(),
            FlowError::InvalidState(_)
        ));
    }
}
