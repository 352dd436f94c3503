use crate::core::connections::Socket;
use crate::core::errors::{FlowError, Result};
use std::cell::RefCell;
use std::rc::Rc;

/// State shared by input and output ports: identity and attached sockets
#[derive(Default)]
pub struct PortBase {
    node: RefCell<Option<String>>,
    name: RefCell<Option<String>>,
    sockets: RefCell<Vec<Option<Rc<Socket>>>>,
}

impl PortBase {
    pub(crate) fn set_node(&self, node: &str) {
        *self.node.borrow_mut() = Some(node.to_string());
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.borrow_mut() = Some(name.to_string());
    }

    pub fn node(&self) -> Option<String> {
        self.node.borrow().clone()
    }

    pub fn name(&self) -> Option<String> {
        self.name.borrow().clone()
    }

    /// Register a socket, returning the slot it landed in
    pub(crate) fn insert(&self, socket: &Rc<Socket>, index: Option<usize>, addressable: bool) -> usize {
        let mut sockets = self.sockets.borrow_mut();
        let idx = match index {
            Some(idx) if addressable => idx,
            _ => sockets.len(),
        };
        if sockets.len() <= idx {
            sockets.resize(idx + 1, None);
        }
        sockets[idx] = Some(socket.clone());
        idx
    }

    pub(crate) fn remove(&self, socket: &Rc<Socket>) -> Option<usize> {
        let mut sockets = self.sockets.borrow_mut();
        let idx = sockets
            .iter()
            .position(|s| s.as_ref().map_or(false, |s| Rc::ptr_eq(s, socket)))?;
        sockets[idx] = None;
        // Trailing empty slots carry no meaning
        while matches!(sockets.last(), Some(None)) {
            sockets.pop();
        }
        Some(idx)
    }

    pub(crate) fn socket(&self, idx: usize) -> Option<Rc<Socket>> {
        self.sockets.borrow().get(idx).cloned().flatten()
    }

    /// All attached sockets in slot order
    pub(crate) fn sockets(&self) -> Vec<Rc<Socket>> {
        self.sockets.borrow().iter().flatten().cloned().collect()
    }

    pub(crate) fn slots(&self) -> usize {
        self.sockets.borrow().len()
    }
}

/// Behavior common to input and output ports
pub trait Port {
    fn base(&self) -> &PortBase;
    fn is_addressable(&self) -> bool;
    fn is_required(&self) -> bool;
    fn is_buffered(&self) -> bool;
    fn datatype(&self) -> &str;
    fn schema(&self) -> Option<&str>;
    fn description(&self) -> Option<&str>;

    /// Human-readable identifier, `node NAME`
    fn id(&self) -> String {
        match (self.base().node(), self.base().name()) {
            (Some(node), Some(name)) => format!("{} {}", node, name.to_uppercase()),
            _ => "Port".to_string(),
        }
    }

    fn name(&self) -> String {
        self.base().name().unwrap_or_default()
    }

    /// Remove a socket, returning the slot it occupied
    fn detach(&self, socket: &Rc<Socket>) -> Option<usize> {
        self.base().remove(socket)
    }

    fn is_attached(&self, index: Option<usize>) -> bool {
        match index {
            Some(idx) if self.is_addressable() => self.base().socket(idx).is_some(),
            _ => !self.base().sockets().is_empty(),
        }
    }

    /// Indices of all attached slots
    fn list_attached(&self) -> Vec<usize> {
        (0..self.base().slots())
            .filter(|idx| self.base().socket(*idx).is_some())
            .collect()
    }

    fn is_connected(&self, index: Option<usize>) -> Result<bool> {
        if self.is_addressable() {
            let idx = index.ok_or_else(|| FlowError::IndexRequired { port: self.id() })?;
            let socket = self
                .base()
                .socket(idx)
                .ok_or_else(|| FlowError::SocketNotAvailable {
                    port: self.id(),
                    index: idx,
                })?;
            return Ok(socket.is_connected());
        }
        Ok(self.base().sockets().iter().any(|s| s.is_connected()))
    }
}
