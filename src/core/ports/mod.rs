pub mod base;
pub mod in_port;
pub mod out_port;
pub mod port_specs;

pub use base::{Port, PortBase};
pub use in_port::InPort;
pub use out_port::OutPort;
pub use port_specs::{InPortConfig, OutPortConfig, VALID_DATATYPES};
