pub mod packet;

// Re-export commonly used types
pub use packet::{Packet, PacketKind};
