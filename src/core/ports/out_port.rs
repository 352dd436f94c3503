use super::base::{Port, PortBase};
use super::port_specs::OutPortConfig;
use crate::core::connections::Socket;
use crate::core::errors::{FlowError, Result};
use crate::core::values::{Packet, PacketKind};
use log::trace;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Output port: fans packets out to every attached socket
pub struct OutPort {
    base: PortBase,
    config: OutPortConfig,
    /// Last Data packet per index, for caching ports
    cache: RefCell<HashMap<Option<usize>, Packet>>,
}

impl OutPort {
    pub fn new(config: OutPortConfig) -> Result<Rc<Self>> {
        Ok(Rc::new(Self {
            base: PortBase::default(),
            config: config.validate()?,
            cache: RefCell::new(HashMap::new()),
        }))
    }

    pub fn config(&self) -> &OutPortConfig {
        &self.config
    }

    pub(crate) fn set_name(&self, name: &str) {
        self.base.set_name(name);
    }

    pub(crate) fn set_node(&self, node: &str) {
        self.base.set_node(node);
    }

    pub fn is_scoped(&self) -> bool {
        self.config.scoped
    }

    pub fn is_caching(&self) -> bool {
        self.config.caching
    }

    /// Attach a socket, replaying the cached value to it when caching
    pub fn attach(&self, socket: &Rc<Socket>, index: Option<usize>) -> Result<usize> {
        let idx = self.base.insert(socket, index, self.is_addressable());
        if self.is_caching() {
            let key = if self.is_addressable() { Some(idx) } else { None };
            let cached = self.cache.borrow().get(&key).cloned();
            if let Some(packet) = cached {
                socket.post(Some(packet.clone_packet()), true)?;
            }
        }
        Ok(idx)
    }

    fn get_sockets(&self, index: Option<usize>) -> Result<Vec<Rc<Socket>>> {
        // Addressable sockets affect only one connection at time
        if self.is_addressable() {
            let idx = index.ok_or_else(|| FlowError::IndexRequired { port: self.id() })?;
            return Ok(self.base.socket(idx).into_iter().collect());
        }
        Ok(self.base.sockets())
    }

    fn check_required(&self, sockets: &[Rc<Socket>]) -> Result<()> {
        if sockets.is_empty() && self.is_required() {
            return Err(FlowError::NoConnections { port: self.id() });
        }
        Ok(())
    }

    /// Send a packet to all attached sockets.
    ///
    /// The first socket receives the packet itself; further sockets receive
    /// fresh copies when the packet is clonable and the same packet otherwise.
    pub fn send_ip(&self, mut packet: Packet) -> Result<()> {
        let sockets = self.get_sockets(packet.index)?;
        self.check_required(&sockets)?;
        if packet.datatype == "all" {
            packet.datatype = self.config.datatype.clone();
        }
        if packet.schema.is_none() {
            packet.schema = self.config.schema.clone();
        }
        if self.is_caching() && packet.is_data() {
            let key = if self.is_addressable() { packet.index } else { None };
            self.cache.borrow_mut().insert(key, packet.clone());
        }
        trace!(target: "rflow::port", "{} sending {:?} to {} sockets", self.id(), packet.kind, sockets.len());
        let mut sockets = sockets.into_iter();
        let Some(first) = sockets.next() else {
            return Ok(());
        };
        let rest: Vec<Rc<Socket>> = sockets.collect();
        let copies: Vec<Packet> = rest
            .iter()
            .map(|_| {
                if packet.clonable {
                    packet.clone_packet()
                } else {
                    packet.clone()
                }
            })
            .collect();
        first.post(Some(packet), true)?;
        for (socket, copy) in rest.iter().zip(copies) {
            socket.post(Some(copy), true)?;
        }
        Ok(())
    }

    /// Build and send a packet of the given kind
    pub fn send(&self, kind: PacketKind, data: impl Into<Value>, index: Option<usize>) -> Result<()> {
        let mut packet = Packet::new(kind, data);
        packet.index = index;
        self.send_ip(packet)
    }

    pub fn open_bracket(&self, data: impl Into<Value>, index: Option<usize>) -> Result<()> {
        self.send(PacketKind::OpenBracket, data, index)
    }

    pub fn data(&self, data: impl Into<Value>, index: Option<usize>) -> Result<()> {
        self.send(PacketKind::Data, data, index)
    }

    pub fn close_bracket(&self, data: impl Into<Value>, index: Option<usize>) -> Result<()> {
        self.send(PacketKind::CloseBracket, data, index)
    }

    /// Disconnect attached sockets
    pub fn disconnect(&self, index: Option<usize>) -> Result<()> {
        for socket in self.get_sockets(index)? {
            socket.disconnect();
        }
        Ok(())
    }
}

impl Port for OutPort {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connections::SocketEvent;
    use serde_json::json;
    use std::cell::RefCell;

    fn capture(socket: &Socket) -> Rc<RefCell<Vec<Packet>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        socket.events().subscribe("ip", move |event| {
            if let SocketEvent::Ip(ip) = event {
                sink.borrow_mut().push(ip.clone());
            }
        });
        seen
    }

    #[test]
    fn test_required_port_without_sockets_fails() {
        let port = OutPort::new(OutPortConfig::new().required()).unwrap();
        port.set_node("A");
        port.set_name("out");
        let err = port.data("x", None).unwrap_err();
        assert_eq!(err.to_string(), "A OUT: no connections available");

        let optional = OutPort::new(OutPortConfig::new()).unwrap();
        assert!(optional.data("x", None).is_ok());
    }

    #[test]
    fn test_addressable_requires_index() {
        let port = OutPort::new(OutPortConfig::new().addressable()).unwrap();
        assert!(matches!(
            port.data("x", None).unwrap_err(),
            FlowError::IndexRequired { .. }
        ));
        let socket = Socket::new(Value::Null);
        port.attach(&socket, Some(1)).unwrap();
        let seen = capture(&socket);
        port.data("x", Some(0)).unwrap();
        port.data("y", Some(1)).unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].data, json!("y"));
    }

    #[test]
    fn test_fan_out_clones_clonable_packets() {
        let port = OutPort::new(OutPortConfig::typed("string")).unwrap();
        let a = Socket::new(Value::Null);
        let b = Socket::new(Value::Null);
        port.attach(&a, None).unwrap();
        port.attach(&b, None).unwrap();
        let seen_a = capture(&a);
        let seen_b = capture(&b);

        let shared = Packet::data("s");
        let shared_id = shared.id;
        port.send_ip(shared).unwrap();
        assert_eq!(seen_a.borrow()[0].id, shared_id);
        assert_eq!(seen_b.borrow()[0].id, shared_id);
        assert_eq!(seen_b.borrow()[0].datatype, "string");

        let clonable = Packet::data("c").clonable();
        let clonable_id = clonable.id;
        port.send_ip(clonable).unwrap();
        assert_eq!(seen_a.borrow()[1].id, clonable_id);
        assert_ne!(seen_b.borrow()[1].id, clonable_id);
    }

    #[test]
    fn test_caching_replays_last_value() {
        let port = OutPort::new(OutPortConfig::new().caching()).unwrap();
        port.data("first", None).unwrap();
        port.data("latest", None).unwrap();
        let socket = Socket::new(Value::Null);
        let seen = capture(&socket);
        port.attach(&socket, None).unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].data, json!("latest"));
    }
}
