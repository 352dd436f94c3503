pub mod socket;

// Re-export commonly used types
pub use socket::{ErrorHandler, Socket, SocketEnd, SocketEvent};
