pub mod core;

// Re-export commonly used types
pub use crate::core::components::{
    Component, ComponentConfig, ComponentEvent, ComponentLoader, ComponentRegistry, LoadContext,
    PortAddress, ProcessInput, ProcessOutput,
};
pub use crate::core::config::NetworkConfig;
pub use crate::core::connections::{Socket, SocketEvent};
pub use crate::core::errors::{FlowError, ProcessFailure, Result};
pub use crate::core::events::{ListenerId, Subject, Topic};
pub use crate::core::network::{Graph, Network, NetworkEvent, NetworkState};
pub use crate::core::ports::{InPort, InPortConfig, OutPort, OutPortConfig};
pub use crate::core::scheduler::{Scheduler, TaskId};
pub use crate::core::values::{Packet, PacketKind};
