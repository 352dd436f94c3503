use super::brackets::{BracketContext, PortRef, ProcessResult, ResultRef};
use super::component::Component;
use crate::core::errors::{FlowError, PortDirection, Result};
use crate::core::ports::{InPort, Port};
use crate::core::values::{Packet, PacketKind};
use log::{debug, warn};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Address of a port slot: a plain name, or a name with an index for
/// addressable ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortAddress {
    Name(String),
    Indexed(String, usize),
}

impl PortAddress {
    pub fn name(&self) -> &str {
        match self {
            PortAddress::Name(name) | PortAddress::Indexed(name, _) => name,
        }
    }

    pub fn index(&self) -> Option<usize> {
        match self {
            PortAddress::Name(_) => None,
            PortAddress::Indexed(_, idx) => Some(*idx),
        }
    }
}

impl From<&str> for PortAddress {
    fn from(name: &str) -> Self {
        PortAddress::Name(name.to_string())
    }
}

impl From<String> for PortAddress {
    fn from(name: String) -> Self {
        PortAddress::Name(name)
    }
}

impl From<(&str, usize)> for PortAddress {
    fn from((name, idx): (&str, usize)) -> Self {
        PortAddress::Indexed(name.to_string(), idx)
    }
}

/// Port list for multi-port queries. No ports means `in`.
fn addresses<P: Clone + Into<PortAddress>>(ports: &[P]) -> Vec<PortAddress> {
    if ports.is_empty() {
        return vec![PortAddress::from("in")];
    }
    ports.iter().cloned().map(Into::into).collect()
}

/// State of one process invocation
pub struct ProcessContext {
    ip: Packet,
    component: Rc<Component>,
    port: Rc<InPort>,
    port_name: String,
    scope: Option<String>,
    result: RefCell<ResultRef>,
    activated: Cell<bool>,
    deactivated: Cell<bool>,
}

impl ProcessContext {
    pub(crate) fn new(
        ip: Packet,
        component: Rc<Component>,
        port: Rc<InPort>,
        port_name: &str,
        result: ResultRef,
    ) -> Rc<Self> {
        let scope = ip.scope.clone();
        Rc::new(Self {
            ip,
            component,
            port,
            port_name: port_name.to_string(),
            scope,
            result: RefCell::new(result),
            activated: Cell::new(false),
            deactivated: Cell::new(false),
        })
    }

    /// Packet that triggered the invocation
    pub fn ip(&self) -> &Packet {
        &self.ip
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn component(&self) -> &Rc<Component> {
        &self.component
    }

    /// Inport the triggering packet arrived on
    pub fn port(&self) -> &Rc<InPort> {
        &self.port
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub(crate) fn result(&self) -> ResultRef {
        self.result.borrow().clone()
    }

    pub fn is_activated(&self) -> bool {
        self.activated.get()
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivated.get()
    }

    pub(crate) fn mark_activated(&self) {
        self.activated.set(true);
        self.deactivated.set(false);
    }

    pub(crate) fn mark_deactivated(&self) {
        self.activated.set(false);
        self.deactivated.set(true);
    }

    /// Activate again, starting a fresh result if the previous one was
    /// already delivered
    pub fn activate(&self) {
        let stale = {
            let result = self.result.borrow();
            let resolved = result.borrow().resolved;
            resolved || !self.component.queue_contains(&result)
        };
        if stale {
            *self.result.borrow_mut() = ProcessResult::new_ref();
        }
        self.component.activate(self);
    }
}

/// Read side of a process invocation
#[derive(Clone)]
pub struct ProcessInput {
    context: Rc<ProcessContext>,
}

impl ProcessInput {
    pub(crate) fn new(context: Rc<ProcessContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Rc<ProcessContext> {
        &self.context
    }

    /// Packet that triggered the invocation
    pub fn ip(&self) -> &Packet {
        self.context.ip()
    }

    pub fn scope(&self) -> Option<&str> {
        self.context.scope()
    }

    /// Mark the invocation as running; ordered components reserve an output
    /// queue slot
    pub fn activate(&self) {
        if self.context.is_activated() {
            return;
        }
        let component = self.context.component();
        if component.is_ordered() {
            self.context.result().borrow_mut().resolved = false;
        }
        component.activate(&self.context);
        if self.context.port().is_addressable() {
            if let Some(idx) = self.context.ip().index {
                debug!(
                    target: "rflow::component",
                    "{} {}[{}] activated",
                    component.node_id(),
                    self.context.port_name(),
                    idx
                );
                return;
            }
        }
        debug!(
            target: "rflow::component",
            "{} {} activated",
            component.node_id(),
            self.context.port_name()
        );
    }

    fn resolve(&self, address: PortAddress) -> Result<(Rc<InPort>, String, Option<usize>)> {
        let component = self.context.component();
        let port = component.in_port(address.name()).cloned().ok_or_else(|| {
            FlowError::port_not_found(component.node_id(), address.name(), PortDirection::In)
        })?;
        match address {
            PortAddress::Name(name) => {
                if port.is_addressable() {
                    return Err(FlowError::addressing(format!(
                        "for addressable ports, access must be with [{}, idx]",
                        name
                    )));
                }
                Ok((port, name, None))
            }
            PortAddress::Indexed(name, idx) => {
                if !port.is_addressable() {
                    return Err(FlowError::addressing(format!(
                        "non-addressable port `{}` must be accessed by name",
                        name
                    )));
                }
                Ok((port, name, Some(idx)))
            }
        }
    }

    /// Connected slots of an addressable inport
    pub fn attached(&self, port: &str) -> Result<Vec<usize>> {
        let component = self.context.component();
        let port = component.in_port(port).ok_or_else(|| {
            FlowError::port_not_found(component.node_id(), port, PortDirection::In)
        })?;
        Ok(port.list_attached())
    }

    /// Whether every listed port holds at least one packet
    pub fn has<P: Clone + Into<PortAddress>>(&self, ports: &[P]) -> Result<bool> {
        self.has_with(ports, &mut |_| true)
    }

    /// Whether every listed port holds a packet accepted by `validate`
    pub fn has_with<P: Clone + Into<PortAddress>>(
        &self,
        ports: &[P],
        validate: &mut dyn FnMut(&Packet) -> bool,
    ) -> Result<bool> {
        for address in addresses(ports) {
            let (port, _, index) = self.resolve(address)?;
            if !port.has(self.scope(), index, validate) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether every listed port holds a data packet
    pub fn has_data<P: Clone + Into<PortAddress>>(&self, ports: &[P]) -> Result<bool> {
        self.has_with(ports, &mut |ip| ip.is_data())
    }

    /// Whether every listed port holds a complete stream
    pub fn has_stream<P: Clone + Into<PortAddress>>(&self, ports: &[P]) -> Result<bool> {
        self.has_stream_with(ports, |_, _| true)
    }

    /// Like [`ProcessInput::has_stream`], with `validate` deciding whether a
    /// data packet (seen with the open brackets around it) counts
    pub fn has_stream_with<P: Clone + Into<PortAddress>>(
        &self,
        ports: &[P],
        mut validate: impl FnMut(&Packet, &[Value]) -> bool,
    ) -> Result<bool> {
        for address in addresses(ports) {
            let (port, _, index) = self.resolve(address)?;
            let mut brackets: Vec<Value> = Vec::new();
            let mut has_data = false;
            let mut complete = |ip: &Packet| match ip.kind {
                PacketKind::OpenBracket => {
                    brackets.push(ip.data.clone());
                    false
                }
                PacketKind::Data => {
                    has_data = validate(ip, &brackets);
                    // A data packet on its own is a complete stream
                    brackets.is_empty() && has_data
                }
                PacketKind::CloseBracket => {
                    brackets.pop();
                    brackets.is_empty() && has_data
                }
            };
            if !port.has(self.scope(), index, &mut complete) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Read the next packet from a port. Forwarding inports consume the
    /// brackets ahead of the next data packet and return that packet.
    pub fn get(&self, port: impl Into<PortAddress>) -> Result<Option<Packet>> {
        let (port, name, index) = self.resolve(port.into())?;
        let component = self.context.component();
        if component.activates_on_input() {
            self.activate();
        }
        if component.is_forwarding_inport(&name) {
            return Ok(self.get_for_forwarding(&port, &name, index));
        }
        Ok(port.get(self.scope(), index))
    }

    pub fn get_many<P: Clone + Into<PortAddress>>(&self, ports: &[P]) -> Result<Vec<Option<Packet>>> {
        addresses(ports)
            .into_iter()
            .map(|address| self.get(address))
            .collect()
    }

    /// Read the next data value from a port, skipping brackets
    pub fn get_data(&self, port: impl Into<PortAddress>) -> Result<Option<Value>> {
        let address = port.into();
        loop {
            match self.get(address.clone())? {
                Some(ip) if ip.is_data() => return Ok(Some(ip.data)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    pub fn get_data_many<P: Clone + Into<PortAddress>>(&self, ports: &[P]) -> Result<Vec<Option<Value>>> {
        addresses(ports)
            .into_iter()
            .map(|address| self.get_data(address))
            .collect()
    }

    /// Read one complete stream: a lone data packet, or everything up to the
    /// bracket closing the outermost open bracket
    pub fn get_stream(&self, port: impl Into<PortAddress>) -> Result<Vec<Packet>> {
        let address = port.into();
        let mut depth = 0usize;
        let mut has_data = false;
        let mut packets = Vec::new();
        while let Some(ip) = self.get(address.clone())? {
            match ip.kind {
                PacketKind::OpenBracket => {
                    if depth == 0 {
                        packets.clear();
                        has_data = false;
                    }
                    depth += 1;
                    packets.push(ip);
                }
                PacketKind::Data => {
                    packets.push(ip);
                    has_data = true;
                    if depth == 0 {
                        break;
                    }
                }
                PacketKind::CloseBracket => {
                    packets.push(ip);
                    depth = depth.saturating_sub(1);
                    if depth == 0 && has_data {
                        break;
                    }
                }
            }
        }
        Ok(packets)
    }

    fn get_for_forwarding(&self, port: &InPort, name: &str, index: Option<usize>) -> Option<Packet> {
        let component = self.context.component();
        let scope = self.scope();
        let mut prefix = Vec::new();
        let mut data = None;
        while let Some(ip) = port.get(scope, index) {
            if ip.is_data() {
                data = Some(ip);
                break;
            }
            prefix.push(ip);
        }

        let result = self.context.result();
        for ip in prefix {
            if ip.is_open_bracket() {
                component.push_bracket_context(name, scope, index, BracketContext::new(ip, name));
                continue;
            }
            let Some(context) = component.pop_bracket_context(name, scope, index) else {
                warn!(
                    target: "rflow::component::brackets",
                    "{} closeBracket on '{}' without open context: '{}'",
                    component.node_id(),
                    name,
                    ip.data
                );
                continue;
            };
            context.borrow_mut().close_ip = Some(ip);
            result.borrow_mut().bracket_closing_before.push(context);
        }
        let stack = component.bracket_stack(name, scope, index);
        result
            .borrow_mut()
            .bracket_context
            .insert(name.to_string(), stack);
        data
    }
}

/// Write side of a process invocation
#[derive(Clone)]
pub struct ProcessOutput {
    context: Rc<ProcessContext>,
}

impl ProcessOutput {
    pub(crate) fn new(context: Rc<ProcessContext>) -> Self {
        Self { context }
    }

    /// Send a packet. Ordered components hold it until earlier invocations
    /// have delivered their results.
    pub fn send_ip(&self, port: impl Into<PortAddress>, mut ip: Packet) -> Result<()> {
        let address = port.into();
        let component = self.context.component();
        let out = component.out_port(address.name()).cloned().ok_or_else(|| {
            FlowError::port_not_found(component.node_id(), address.name(), PortDirection::Out)
        })?;
        if ip.scope.is_none() {
            ip.scope = self.context.scope.clone();
        }
        if let Some(idx) = address.index() {
            ip.index = Some(idx);
        }
        if out.is_addressable() && ip.index.is_none() {
            return Err(FlowError::IndexRequired { port: out.id() });
        }
        if component.is_ordered() {
            let target = PortRef {
                name: address.name().to_string(),
                index: address.index(),
            };
            let result = self.context.result();
            let mut result = result.borrow_mut();
            return component.add_to_result(&mut result, &target, ip, false);
        }
        if !out.is_scoped() {
            ip.scope = None;
        }
        out.send_ip(ip)
    }

    /// Send a data value
    pub fn send(&self, port: impl Into<PortAddress>, data: impl Into<Value>) -> Result<()> {
        self.send_ip(port, Packet::data(data))
    }

    /// Send a value to the only non-error outport
    pub fn send_data(&self, data: impl Into<Value>) -> Result<()> {
        let component = self.context.component();
        let ports: Vec<&String> = component
            .out_ports()
            .keys()
            .filter(|name| name.as_str() != "error")
            .collect();
        match ports.as_slice() {
            [port] => self.send(port.as_str(), data),
            _ => Err(FlowError::component(
                "port must be specified for sending output",
            )),
        }
    }

    /// Send several `(port, value)` pairs in order
    pub fn send_all<I, K, V>(&self, outputs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<PortAddress>,
        V: Into<Value>,
    {
        for (port, data) in outputs {
            self.send(port, data)?;
        }
        Ok(())
    }

    /// Send a value and finish the invocation
    pub fn send_done(&self, port: impl Into<PortAddress>, data: impl Into<Value>) -> Result<()> {
        self.send(port, data)?;
        self.done(None)
    }

    /// Report errors on the `error` outport. Two or more errors are wrapped
    /// in one anonymous bracket group; a single error is sent bare, the same
    /// as an error passed to [`ProcessOutput::done`]. Without a usable error
    /// port the first error is returned.
    pub fn error(&self, errors: Vec<FlowError>) -> Result<()> {
        let usable = self
            .context
            .component()
            .out_port("error")
            .map_or(false, |port| port.is_attached(None) || !port.is_required());
        if !usable {
            return match errors.into_iter().next() {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }
        let grouped = errors.len() > 1;
        if grouped {
            self.send_ip("error", Packet::open_bracket(Value::Null))?;
        }
        for err in errors {
            self.send_ip("error", Packet::data(err.to_string()))?;
        }
        if grouped {
            self.send_ip("error", Packet::close_bracket(Value::Null))?;
        }
        Ok(())
    }

    /// Forward the triggering packet to `out` with new data and finish
    pub fn pass(&self, data: impl Into<Value>) -> Result<()> {
        self.pass_with(data, |_| {})
    }

    /// Like [`ProcessOutput::pass`], letting `update` adjust the packet first
    pub fn pass_with(&self, data: impl Into<Value>, update: impl FnOnce(&mut Packet)) -> Result<()> {
        let component = self.context.component();
        if component.out_port("out").is_none() {
            return Err(FlowError::port_not_found(
                component.node_id(),
                "out",
                PortDirection::Out,
            ));
        }
        let mut ip = self.context.ip().clone();
        update(&mut ip);
        ip.data = data.into();
        self.send_ip("out", ip)?;
        self.done(None)
    }

    /// Finish the invocation, optionally reporting an error. Always
    /// deactivates, even when the error cannot be delivered.
    pub fn done(&self, err: Option<FlowError>) -> Result<()> {
        let component = self.context.component();
        let result = self.context.result();
        result.borrow_mut().resolved = true;
        component.activate(&self.context);
        let reported = match err {
            Some(err) => self.error(vec![err]),
            None => Ok(()),
        };
        if component.is_ordered() && component.is_last_result(&result) {
            component.close_dangling_brackets(self.context.scope(), &result);
        }
        let deactivated = component.deactivate(&self.context);
        reported.and(deactivated)
    }
}
