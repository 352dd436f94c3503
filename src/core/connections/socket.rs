use crate::core::errors::{FlowError, ProcessFailure, Result};
use crate::core::events::{Subject, Topic};
use crate::core::ports::InPort;
use crate::core::values::{Packet, PacketKind};
use log::{debug, trace};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// One end of a socket: a process port, optionally indexed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEnd {
    pub node: String,
    pub port: String,
    pub index: Option<usize>,
}

impl SocketEnd {
    pub fn new(node: impl Into<String>, port: impl Into<String>, index: Option<usize>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
            index,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SocketEvent {
    Connect,
    Ip(Packet),
    Disconnect,
}

impl Topic for SocketEvent {
    fn topic(&self) -> &'static str {
        match self {
            SocketEvent::Connect => "connect",
            SocketEvent::Ip(_) => "ip",
            SocketEvent::Disconnect => "disconnect",
        }
    }
}

/// Receives component failures caught on a socket. Returning `Ok` means the
/// failure was handled; returning the error lets it propagate to the sender.
pub type ErrorHandler = Rc<dyn Fn(FlowError) -> Result<()>>;

struct SocketTarget {
    port: Weak<InPort>,
    index: usize,
}

/// Point-to-point channel from one output port slot to one input port slot.
///
/// The socket keeps a bracket stack so that it can open and close its
/// connection around complete streams and drop CloseBrackets that have no
/// matching OpenBracket.
pub struct Socket {
    metadata: Value,
    from: RefCell<Option<SocketEnd>>,
    to: RefCell<Option<SocketEnd>>,
    target: RefCell<Option<SocketTarget>>,
    brackets: RefCell<Vec<Value>>,
    connected: Cell<bool>,
    data_delegate: RefCell<Option<Value>>,
    debug: Cell<bool>,
    error_handler: RefCell<Option<ErrorHandler>>,
    events: Subject<SocketEvent>,
}

impl Socket {
    pub fn new(metadata: Value) -> Rc<Self> {
        Rc::new(Self {
            metadata,
            from: RefCell::new(None),
            to: RefCell::new(None),
            target: RefCell::new(None),
            brackets: RefCell::new(Vec::new()),
            connected: Cell::new(false),
            data_delegate: RefCell::new(None),
            debug: Cell::new(true),
            error_handler: RefCell::new(None),
            events: Subject::new(),
        })
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn events(&self) -> &Subject<SocketEvent> {
        &self.events
    }

    pub fn from(&self) -> Option<SocketEnd> {
        self.from.borrow().clone()
    }

    pub fn to(&self) -> Option<SocketEnd> {
        self.to.borrow().clone()
    }

    pub fn set_from(&self, end: Option<SocketEnd>) {
        *self.from.borrow_mut() = end;
    }

    pub fn set_to(&self, end: Option<SocketEnd>) {
        *self.to.borrow_mut() = end;
    }

    /// Rename the process on either end
    pub(crate) fn rename_node(&self, old: &str, new: &str) {
        for end in [&self.from, &self.to] {
            if let Some(end) = end.borrow_mut().as_mut() {
                if end.node == old {
                    end.node = new.to_string();
                }
            }
        }
    }

    pub fn set_debug(&self, debug: bool) {
        self.debug.set(debug);
    }

    pub fn set_error_handler(&self, handler: Option<ErrorHandler>) {
        *self.error_handler.borrow_mut() = handler;
    }

    /// Value posted when the socket is fired without a packet
    pub fn set_data_delegate(&self, value: Option<Value>) {
        *self.data_delegate.borrow_mut() = value;
    }

    pub(crate) fn set_target(&self, port: Weak<InPort>, index: usize) {
        *self.target.borrow_mut() = Some(SocketTarget { port, index });
    }

    pub(crate) fn clear_target(&self) {
        *self.target.borrow_mut() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    /// Depth of currently open brackets
    pub fn bracket_depth(&self) -> usize {
        self.brackets.borrow().len()
    }

    pub fn connect(&self) {
        if self.connected.get() {
            return;
        }
        self.connected.set(true);
        self.events.emit(&SocketEvent::Connect);
    }

    pub fn disconnect(&self) {
        if !self.connected.get() {
            return;
        }
        self.connected.set(false);
        self.events.emit(&SocketEvent::Disconnect);
    }

    /// Post a packet through the socket.
    ///
    /// `None` posts the data delegate value (port default), if any. The
    /// socket connects before the first packet of a stream and, when
    /// `auto_disconnect` is set, disconnects once all brackets are closed.
    pub fn post(&self, packet: Option<Packet>, auto_disconnect: bool) -> Result<()> {
        let packet = match packet {
            Some(packet) => packet,
            None => match self.data_delegate.borrow().clone() {
                Some(value) => Packet::data(value),
                None => return Ok(()),
            },
        };
        if !self.is_connected() && self.bracket_depth() == 0 {
            self.connect();
        }
        self.handle_ip(packet)?;
        if auto_disconnect && self.is_connected() && self.bracket_depth() == 0 {
            self.disconnect();
        }
        Ok(())
    }

    /// Fire the data delegate value within its own connect/disconnect pair
    pub fn send_default(&self) -> Result<()> {
        self.connect();
        self.post(None, false)?;
        self.disconnect();
        Ok(())
    }

    fn handle_ip(&self, packet: Packet) -> Result<()> {
        match packet.kind {
            PacketKind::OpenBracket => self.brackets.borrow_mut().push(packet.data.clone()),
            PacketKind::CloseBracket => {
                // Prevent closing already closed brackets
                if self.brackets.borrow_mut().pop().is_none() {
                    debug!(target: "rflow::socket", "{} dropped unmatched closeBracket", self.id());
                    return Ok(());
                }
            }
            PacketKind::Data => {}
        }
        trace!(target: "rflow::socket", "{} {:?} {}", self.id(), packet.kind, packet.data);
        self.events.emit(&SocketEvent::Ip(packet.clone()));
        self.deliver(packet)
    }

    fn deliver(&self, packet: Packet) -> Result<()> {
        let target = self
            .target
            .borrow()
            .as_ref()
            .and_then(|t| t.port.upgrade().map(|port| (port, t.index)));
        let Some((port, index)) = target else {
            return Ok(());
        };
        match port.handle_ip(packet, index) {
            Ok(()) => Ok(()),
            Err(err) => self.handle_error(err),
        }
    }

    fn handle_error(&self, err: FlowError) -> Result<()> {
        // Failures coming from further downstream were already offered to
        // a handler by the socket that wrapped them
        if !self.debug.get() || err.is_wrapped() {
            return Err(err);
        }
        let id = self
            .to
            .borrow()
            .as_ref()
            .map(|end| end.node.clone())
            .unwrap_or_default();
        let err = FlowError::Process(ProcessFailure {
            id,
            metadata: self.metadata.clone(),
            subgraph: Vec::new(),
            error: Box::new(err),
        });
        let handler = self.error_handler.borrow().clone();
        match handler {
            Some(handler) => handler(err),
            None => Err(err),
        }
    }

    pub fn id(&self) -> String {
        SocketId {
            from: self.from.borrow().as_ref(),
            to: self.to.borrow().as_ref(),
        }
        .to_string()
    }
}

struct SocketId<'a> {
    from: Option<&'a SocketEnd>,
    to: Option<&'a SocketEnd>,
}

impl fmt::Display for SocketId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let from = |end: &SocketEnd| format!("{}() {}", end.node, end.port.to_uppercase());
        let to = |end: &SocketEnd| format!("{} {}()", end.port.to_uppercase(), end.node);
        match (self.from, self.to) {
            (None, None) => write!(f, "UNDEFINED"),
            (Some(source), None) => write!(f, "{} -> ANON", from(source)),
            (None, Some(target)) => write!(f, "DATA -> {}", to(target)),
            (Some(source), Some(target)) => write!(f, "{} -> {}", from(source), to(target)),
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("connected", &self.connected.get())
            .field("brackets", &self.brackets.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recording(socket: &Socket) -> Rc<RefCell<Vec<String>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        socket.events().subscribe_all(move |event| {
            let entry = match event {
                SocketEvent::Connect => "connect".to_string(),
                SocketEvent::Disconnect => "disconnect".to_string(),
                SocketEvent::Ip(ip) => format!("{:?}:{}", ip.kind, ip.data),
            };
            sink.borrow_mut().push(entry);
        });
        seen
    }

    #[test]
    fn test_stream_keeps_connection_open() {
        let socket = Socket::new(Value::Null);
        let seen = recording(&socket);
        socket.post(Some(Packet::open_bracket("a")), true).unwrap();
        assert!(socket.is_connected());
        socket.post(Some(Packet::data(1)), true).unwrap();
        socket.post(Some(Packet::close_bracket("a")), true).unwrap();
        assert!(!socket.is_connected());
        assert_eq!(
            *seen.borrow(),
            vec![
                "connect",
                "OpenBracket:\"a\"",
                "Data:1",
                "CloseBracket:\"a\"",
                "disconnect"
            ]
        );
    }

    #[test]
    fn test_unmatched_close_is_dropped() {
        let socket = Socket::new(Value::Null);
        let seen = recording(&socket);
        socket.post(Some(Packet::close_bracket("x")), true).unwrap();
        assert_eq!(*seen.borrow(), vec!["connect", "disconnect"]);
        assert_eq!(socket.bracket_depth(), 0);
    }

    #[test]
    fn test_data_delegate() {
        let socket = Socket::new(Value::Null);
        let seen = recording(&socket);
        socket.post(None, true).unwrap();
        assert!(seen.borrow().is_empty());
        socket.set_data_delegate(Some(json!("fallback")));
        socket.send_default().unwrap();
        assert_eq!(
            *seen.borrow(),
            vec!["connect", "Data:\"fallback\"", "disconnect"]
        );
    }

    #[test]
    fn test_socket_id() {
        let socket = Socket::new(Value::Null);
        assert_eq!(socket.id(), "UNDEFINED");
        socket.set_to(Some(SocketEnd::new("B", "in", None)));
        assert_eq!(socket.id(), "DATA -> IN B()");
        socket.set_from(Some(SocketEnd::new("A", "out", None)));
        assert_eq!(socket.id(), "A() OUT -> IN B()");
        socket.rename_node("A", "Source");
        assert_eq!(socket.id(), "Source() OUT -> IN B()");
    }
}
