use super::base::{Port, PortBase};
use super::port_specs::InPortConfig;
use crate::core::components::Component;
use crate::core::connections::Socket;
use crate::core::errors::{FlowError, Result};
use crate::core::values::Packet;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

/// Buffer address inside an input port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BufferKey {
    scope: Option<String>,
    index: Option<usize>,
}

#[derive(Default)]
struct Buffers {
    live: HashMap<BufferKey, VecDeque<Packet>>,
    /// One-shot seed packets, keyed by index only
    initial: HashMap<Option<usize>, VecDeque<Packet>>,
}

/// Input port: buffers arriving packets per (scope, index) and hands them to
/// the owning component.
pub struct InPort {
    base: PortBase,
    config: InPortConfig,
    component: RefCell<Weak<Component>>,
    buffers: RefCell<Buffers>,
}

impl InPort {
    pub fn new(config: InPortConfig) -> Result<Rc<Self>> {
        Ok(Rc::new(Self {
            base: PortBase::default(),
            config: config.validate()?,
            component: RefCell::new(Weak::new()),
            buffers: RefCell::new(Buffers::default()),
        }))
    }

    pub fn config(&self) -> &InPortConfig {
        &self.config
    }

    pub(crate) fn bind(&self, component: Weak<Component>, name: &str) {
        *self.component.borrow_mut() = component;
        self.base.set_name(name);
    }

    pub(crate) fn set_node(&self, node: &str) {
        self.base.set_node(node);
    }

    pub fn is_control(&self) -> bool {
        self.config.control
    }

    /// Buffered and control ports hold only the most recent Data packet
    fn keeps_latest(&self) -> bool {
        self.config.control || self.config.buffered
    }

    pub fn is_triggering(&self) -> bool {
        self.config.triggering
    }

    pub fn is_scoped(&self) -> bool {
        self.config.scoped
    }

    pub fn has_default(&self) -> bool {
        self.config.default.is_some()
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.config.default.as_ref()
    }

    /// Attach a socket delivering into this port
    pub fn attach(self: &Rc<Self>, socket: &Rc<Socket>, index: Option<usize>) -> usize {
        let idx = self.base.insert(socket, index, self.is_addressable());
        if let Some(default) = &self.config.default {
            socket.set_data_delegate(Some(default.clone()));
        }
        socket.set_target(Rc::downgrade(self), idx);
        idx
    }

    pub fn detach_socket(&self, socket: &Rc<Socket>) -> Option<usize> {
        let idx = self.detach(socket)?;
        socket.clear_target();
        Some(idx)
    }

    /// Number of sockets attached, counting every live slot
    pub fn socket_count(&self) -> usize {
        self.base.sockets().len()
    }

    fn validate_data(&self, data: &Value) -> Result<()> {
        let Some(values) = &self.config.values else {
            return Ok(());
        };
        if values.contains(data) {
            return Ok(());
        }
        let allowed: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        Err(FlowError::InvalidValue {
            port: self.id(),
            value: data.to_string(),
            allowed: allowed.join(", "),
        })
    }

    fn normalize_index(&self, index: Option<usize>) -> Option<usize> {
        if self.is_addressable() {
            index
        } else {
            None
        }
    }

    fn normalize_scope(&self, scope: Option<&str>) -> Option<String> {
        if self.config.scoped {
            scope.map(str::to_string)
        } else {
            None
        }
    }

    /// Accept a packet from a socket attached at slot `index`
    pub fn handle_ip(&self, mut packet: Packet, index: usize) -> Result<()> {
        if self.keeps_latest() && !packet.is_data() {
            return Ok(());
        }
        if packet.is_data() {
            self.validate_data(&packet.data)?;
        }
        packet.owner = self.base.node();
        if self.is_addressable() {
            packet.index = Some(index);
        }
        if packet.datatype == "all" {
            // Stamp non-specific packets with port datatype
            packet.datatype = self.config.datatype.clone();
        }
        if packet.schema.is_none() {
            packet.schema = self.config.schema.clone();
        }
        {
            let scope = self.normalize_scope(packet.scope.as_deref());
            let index = self.normalize_index(packet.index);
            let mut buffers = self.buffers.borrow_mut();
            let buf = if scope.is_none() && packet.initial {
                buffers.initial.entry(index).or_default()
            } else {
                let key = BufferKey { scope, index };
                buffers.live.entry(key).or_default()
            };
            buf.push_back(packet.clone());
            if self.keeps_latest() && buf.len() > 1 {
                buf.pop_front();
            }
        }
        let component = self.component.borrow().upgrade();
        match component {
            Some(component) => component.handle_ip(packet, &self.name()),
            None => Ok(()),
        }
    }

    fn with_buffer<R>(
        &self,
        scope: Option<&str>,
        index: Option<usize>,
        initial: bool,
        f: impl FnOnce(&mut VecDeque<Packet>) -> R,
    ) -> Option<R> {
        let index = self.normalize_index(index);
        let mut buffers = self.buffers.borrow_mut();
        if initial {
            return buffers.initial.get_mut(&index).map(f);
        }
        let key = BufferKey {
            scope: self.normalize_scope(scope),
            index,
        };
        buffers.live.get_mut(&key).map(f)
    }

    /// Copy of a buffer's contents
    pub fn buffer(&self, scope: Option<&str>, index: Option<usize>, initial: bool) -> Vec<Packet> {
        self.with_buffer(scope, index, initial, |buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// First packet of the live buffer without consuming it
    pub fn peek(&self, scope: Option<&str>, index: Option<usize>) -> Option<Packet> {
        self.with_buffer(scope, index, false, |buf| buf.front().cloned())
            .flatten()
    }

    /// Count of Data packets waiting in the live buffer
    pub fn data_count(&self, scope: Option<&str>, index: Option<usize>) -> usize {
        self.with_buffer(scope, index, false, |buf| {
            buf.iter().filter(|p| p.is_data()).count()
        })
        .unwrap_or(0)
    }

    fn get_from_buffer(&self, scope: Option<&str>, index: Option<usize>, initial: bool) -> Option<Packet> {
        let latest = self.keeps_latest();
        self.with_buffer(scope, index, initial, |buf| {
            if latest {
                buf.back().cloned()
            } else {
                buf.pop_front()
            }
        })
        .flatten()
    }

    /// Fetch the next packet, falling back to the initial packet buffer
    pub fn get(&self, scope: Option<&str>, index: Option<usize>) -> Option<Packet> {
        self.get_from_buffer(scope, index, false)
            .or_else(|| self.get_from_buffer(None, index, true))
    }

    fn has_ip_in_buffer(
        &self,
        scope: Option<&str>,
        index: Option<usize>,
        validate: &mut dyn FnMut(&Packet) -> bool,
        initial: bool,
    ) -> bool {
        let packets = self.buffer(scope, index, initial);
        packets.iter().any(|p| validate(p))
    }

    /// Whether the port holds a packet satisfying `validate`
    pub fn has(
        &self,
        scope: Option<&str>,
        index: Option<usize>,
        validate: &mut dyn FnMut(&Packet) -> bool,
    ) -> bool {
        self.has_ip_in_buffer(scope, index, validate, false)
            || self.has_ip_in_buffer(None, index, validate, true)
    }

    pub fn length(&self, scope: Option<&str>, index: Option<usize>) -> usize {
        self.with_buffer(scope, index, false, |buf| buf.len())
            .unwrap_or(0)
    }

    pub fn ready(&self, scope: Option<&str>, index: Option<usize>) -> bool {
        self.length(scope, index) > 0
    }

    /// Drop every buffered packet
    pub fn clear(&self) {
        *self.buffers.borrow_mut() = Buffers::default();
    }
}

impl Port for InPort {
    fn base(&self) -> &PortBase {
        &self.base
    }

    fn is_addressable(&self) -> bool {
        self.config.addressable
    }

    fn is_required(&self) -> bool {
        self.config.required
    }

    fn is_buffered(&self) -> bool {
        self.config.buffered
    }

    fn datatype(&self) -> &str {
        &self.config.datatype
    }

    fn schema(&self) -> Option<&str> {
        self.config.schema.as_deref()
    }

    fn description(&self) -> Option<&str> {
        self.config.description.as_deref()
    }
}
