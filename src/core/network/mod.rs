pub mod graph;
pub mod network;

// Re-export commonly used types
pub use graph::{EdgeEnd, ExportedPort, Graph, GraphEdge, GraphInitial, GraphNode};
pub use network::{IpEvent, Network, NetworkEvent, NetworkProcess, NetworkState};
