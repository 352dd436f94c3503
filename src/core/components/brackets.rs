use crate::core::values::Packet;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// An output (or input) port slot: a port name plus an index for
/// addressable ports
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub name: String,
    pub index: Option<usize>,
}

impl PortRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: None,
        }
    }

    pub fn indexed(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index: Some(index),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(idx) => write!(f, "{}[{}]", self.name, idx),
            None => write!(f, "{}", self.name),
        }
    }
}

/// An open bracket that arrived on a forwarding inport, and the outports it
/// has been relayed to so far
#[derive(Debug, Clone)]
pub struct BracketContext {
    pub ip: Packet,
    pub ports: Vec<PortRef>,
    /// Inport the bracket arrived on
    pub source: String,
    /// The matching close bracket once it has been read
    pub close_ip: Option<Packet>,
}

impl BracketContext {
    pub fn new(ip: Packet, source: impl Into<String>) -> ContextRef {
        Rc::new(RefCell::new(Self {
            ip,
            ports: Vec::new(),
            source: source.into(),
            close_ip: None,
        }))
    }
}

pub type ContextRef = Rc<RefCell<BracketContext>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BracketSide {
    In,
    Out,
}

/// Address of a bracket context stack. The index is only set for
/// addressable ports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BracketKey {
    pub side: BracketSide,
    pub port: String,
    pub index: Option<usize>,
    pub scope: Option<String>,
}

/// Per-port, per-scope stacks of in-flight bracket contexts
#[derive(Default)]
pub struct BracketContexts {
    stacks: IndexMap<BracketKey, Vec<ContextRef>>,
}

impl BracketContexts {
    /// Snapshot of a stack, bottom first
    pub fn stack(&self, key: &BracketKey) -> Vec<ContextRef> {
        self.stacks.get(key).cloned().unwrap_or_default()
    }

    pub fn get(&self, key: &BracketKey, position: usize) -> Option<ContextRef> {
        self.stacks.get(key).and_then(|stack| stack.get(position).cloned())
    }

    pub fn last(&self, key: &BracketKey) -> Option<ContextRef> {
        self.stacks.get(key).and_then(|stack| stack.last().cloned())
    }

    pub fn push(&mut self, key: BracketKey, context: ContextRef) {
        self.stacks.entry(key).or_default().push(context);
    }

    pub fn pop(&mut self, key: &BracketKey) -> Option<ContextRef> {
        self.stacks.get_mut(key).and_then(|stack| stack.pop())
    }

    /// Keys of every stack on one side that belong to `scope`
    pub fn keys_in_scope(&self, side: BracketSide, scope: Option<&str>) -> Vec<BracketKey> {
        self.stacks
            .keys()
            .filter(|key| key.side == side && key.scope.as_deref() == scope)
            .cloned()
            .collect()
    }

    pub fn depth(&self, key: &BracketKey) -> usize {
        self.stacks.get(key).map_or(0, Vec::len)
    }

    pub fn clear(&mut self) {
        self.stacks.clear();
    }
}

/// Packets produced for one output port of a result
#[derive(Debug, Clone)]
pub enum PortOutput {
    Single(Vec<Packet>),
    Indexed(BTreeMap<usize, Vec<Packet>>),
}

/// Output accumulated by one activation of an ordered component, plus the
/// bracket bookkeeping needed to forward brackets around it
#[derive(Debug, Default)]
pub struct ProcessResult {
    pub resolved: bool,
    pub outputs: IndexMap<String, PortOutput>,
    /// Contexts closed before the data packet was read (case A)
    pub bracket_closing_before: Vec<ContextRef>,
    /// Snapshot of the inport context stacks at read time, by inport
    pub bracket_context: IndexMap<String, Vec<ContextRef>>,
    /// Contexts closed right after the activation finished (cases B and C)
    pub bracket_closing_after: Vec<ContextRef>,
}

pub type ResultRef = Rc<RefCell<ProcessResult>>;

impl ProcessResult {
    pub fn new_ref() -> ResultRef {
        Rc::new(RefCell::new(Self::default()))
    }

    /// A resolved entry whose only job is to emit closing brackets
    pub fn is_closing_only(&self) -> bool {
        self.resolved
            && self.outputs.is_empty()
            && self.bracket_closing_before.is_empty()
            && self.bracket_context.is_empty()
            && !self.bracket_closing_after.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(side: BracketSide, port: &str, scope: Option<&str>) -> BracketKey {
        BracketKey {
            side,
            port: port.to_string(),
            index: None,
            scope: scope.map(str::to_string),
        }
    }

    #[test]
    fn test_stacks_are_isolated_by_scope_and_side() {
        let mut contexts = BracketContexts::default();
        contexts.push(
            key(BracketSide::In, "in", Some("a")),
            BracketContext::new(Packet::open_bracket("x"), "in"),
        );
        contexts.push(
            key(BracketSide::In, "in", None),
            BracketContext::new(Packet::open_bracket("y"), "in"),
        );
        contexts.push(
            key(BracketSide::Out, "out", Some("a")),
            BracketContext::new(Packet::open_bracket("x"), "in"),
        );

        let scoped = contexts.keys_in_scope(BracketSide::In, Some("a"));
        assert_eq!(scoped, vec![key(BracketSide::In, "in", Some("a"))]);
        assert_eq!(contexts.depth(&key(BracketSide::In, "in", None)), 1);
        assert!(contexts.pop(&key(BracketSide::In, "in", Some("b"))).is_none());

        let popped = contexts.pop(&key(BracketSide::In, "in", Some("a"))).unwrap();
        assert_eq!(popped.borrow().ip.data, "x");
        assert_eq!(contexts.depth(&key(BracketSide::In, "in", Some("a"))), 0);
    }

    #[test]
    fn test_closing_only_result() {
        let mut result = ProcessResult {
            resolved: true,
            ..Default::default()
        };
        assert!(!result.is_closing_only());
        result
            .bracket_closing_after
            .push(BracketContext::new(Packet::open_bracket("a"), "in"));
        assert!(result.is_closing_only());
        result
            .outputs
            .insert("out".to_string(), PortOutput::Single(vec![Packet::data(1)]));
        assert!(!result.is_closing_only());
    }

    #[test]
    fn test_port_ref_display() {
        assert_eq!(PortRef::new("out").to_string(), "out");
        assert_eq!(PortRef::indexed("out", 2).to_string(), "out[2]");
    }
}
