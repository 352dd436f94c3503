use crate::core::errors::{FlowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global packet id counter, gives every packet instance an identity
static PACKET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_packet_id() -> u64 {
    PACKET_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// What a packet carries: a value or a stream delimiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PacketKind {
    Data,
    OpenBracket,
    CloseBracket,
}

impl PacketKind {
    pub fn is_bracket(&self) -> bool {
        !matches!(self, PacketKind::Data)
    }
}

/// Information packet, the atomic unit flowing through a network.
///
/// Cloning with `Clone` keeps the identity (`id`); [`Packet::clone_packet`]
/// creates a fresh packet with the same contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub id: u64,
    pub kind: PacketKind,
    pub data: Value,
    /// Correlation id isolating concurrent requests sharing a network
    pub scope: Option<String>,
    /// Node currently holding the packet
    pub owner: Option<String>,
    /// Whether fan-out should hand a fresh copy to every extra socket
    pub clonable: bool,
    /// Target slot on an addressable port
    pub index: Option<usize>,
    pub datatype: String,
    pub schema: Option<String>,
    /// Set for initial packets seeded by the network
    pub initial: bool,
}

impl Packet {
    /// Create a packet of any kind
    pub fn new(kind: PacketKind, data: impl Into<Value>) -> Self {
        Self {
            id: next_packet_id(),
            kind,
            data: data.into(),
            scope: None,
            owner: None,
            clonable: false,
            index: None,
            datatype: "all".to_string(),
            schema: None,
            initial: false,
        }
    }

    pub fn data(data: impl Into<Value>) -> Self {
        Self::new(PacketKind::Data, data)
    }

    pub fn open_bracket(data: impl Into<Value>) -> Self {
        Self::new(PacketKind::OpenBracket, data)
    }

    pub fn close_bracket(data: impl Into<Value>) -> Self {
        Self::new(PacketKind::CloseBracket, data)
    }

    /// Initial packet delivered once when the network starts
    pub fn initial(data: impl Into<Value>) -> Self {
        let mut packet = Self::data(data);
        packet.initial = true;
        packet
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_datatype(mut self, datatype: impl Into<String>) -> Self {
        self.datatype = datatype.into();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn clonable(mut self) -> Self {
        self.clonable = true;
        self
    }

    pub fn is_data(&self) -> bool {
        self.kind == PacketKind::Data
    }

    pub fn is_open_bracket(&self) -> bool {
        self.kind == PacketKind::OpenBracket
    }

    pub fn is_close_bracket(&self) -> bool {
        self.kind == PacketKind::CloseBracket
    }

    /// Same packet instance, compared by identity rather than contents
    pub fn same_as(&self, other: &Packet) -> bool {
        self.id == other.id
    }

    /// Fresh packet with the same contents; ownership is not carried over
    pub fn clone_packet(&self) -> Self {
        Self {
            id: next_packet_id(),
            owner: None,
            ..self.clone()
        }
    }

    /// Hand the packet over to a new owner without copying
    pub fn move_to(&mut self, owner: impl Into<String>) {
        self.owner = Some(owner.into());
    }

    /// Deserialize the payload into a concrete type
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| FlowError::TypeMismatch {
            packet: self.id,
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_packet_defaults() {
        let packet = Packet::data(42);
        assert!(packet.is_data());
        assert_eq!(packet.datatype, "all");
        assert_eq!(packet.scope, None);
        assert!(!packet.initial);
        assert_eq!(packet.data_as::<i64>().unwrap(), 42);
    }

    #[test]
    fn test_data_as_reports_type_mismatch() {
        let packet = Packet::data("forty-two");
        let err = packet.data_as::<i64>().unwrap_err();
        assert!(matches!(err, FlowError::TypeMismatch { packet: id, .. } if id == packet.id));
    }

    #[test]
    fn test_clone_packet_gets_new_identity() {
        let mut packet = Packet::open_bracket("a").with_scope("req-1").with_index(2);
        packet.move_to("Split");
        let copy = packet.clone_packet();
        assert!(!copy.same_as(&packet));
        assert_eq!(copy.owner, None);
        assert_eq!(copy.scope.as_deref(), Some("req-1"));
        assert_eq!(copy.index, Some(2));
        assert_eq!(copy.data, json!("a"));
        assert!(packet.clone().same_as(&packet));
    }

    #[test]
    fn test_kind_serialization() {
        let packet = Packet::close_bracket(json!(null));
        let encoded = serde_json::to_value(&packet).unwrap();
        assert_eq!(encoded["kind"], json!("closeBracket"));
        assert!(packet.kind.is_bracket());
    }
}
