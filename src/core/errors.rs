use serde_json::Value;
use std::fmt;

pub type Result<T> = std::result::Result<T, FlowError>;

/// Direction of a port, used in wiring diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    In,
    Out,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::In => write!(f, "inport"),
            PortDirection::Out => write!(f, "outport"),
        }
    }
}

/// A component failure captured by the socket that delivered into it.
#[derive(Debug, Clone)]
pub struct ProcessFailure {
    /// Node id of the failing process
    pub id: String,
    /// Metadata of the socket that delivered the triggering packet
    pub metadata: Value,
    /// Path of subgraph node ids, outermost first
    pub subgraph: Vec<String>,
    pub error: Box<FlowError>,
}

impl fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.subgraph.is_empty() {
            write!(f, "process `{}` failed: {}", self.id, self.error)
        } else {
            write!(
                f,
                "process `{}` in subgraph {} failed: {}",
                self.id,
                self.subgraph.join("/"),
                self.error
            )
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowError {
    #[error("component `{component}` not available")]
    ComponentNotFound { component: String },
    #[error("node `{node}` not found")]
    NodeNotFound { node: String },
    #[error("no component defined for node `{node}`")]
    NoComponent { node: String },
    #[error("no {direction} `{port}` defined in process `{node}`")]
    PortNotFound {
        node: String,
        port: String,
        direction: PortDirection,
    },
    #[error("no connection to `{node}` port `{port}` found")]
    EdgeNotFound { node: String, port: String },
    #[error("{port}: no connections available")]
    NoConnections { port: String },
    #[error("{port}: socket index required")]
    IndexRequired { port: String },
    #[error("{port}: socket {index} not available")]
    SocketNotAvailable { port: String, index: usize },
    #[error("invalid data `{value}` received on {port}, not in [{allowed}]")]
    InvalidValue {
        port: String,
        value: String,
        allowed: String,
    },
    #[error("invalid port datatype `{datatype}` specified, valid are {valid}")]
    InvalidDatatype { datatype: String, valid: String },
    #[error("invalid port schema `{schema}` specified, should be URL or MIME type")]
    InvalidSchema { schema: String },
    #[error("{message}")]
    AddressingMismatch { message: String },
    #[error("type mismatch in packet {packet}: {message}")]
    TypeMismatch { packet: u64, message: String },
    #[error("processing function not defined for `{node}`")]
    ProcessNotDefined { node: String },
    #[error("{0}")]
    Component(String),
    #[error("{0}")]
    Process(ProcessFailure),
    #[error("lifecycle hook of `{node}` failed: {message}")]
    Lifecycle { node: String, message: String },
    #[error("invalid network state: {0}")]
    InvalidState(String),
}

impl FlowError {
    /// Error raised by a process function
    pub fn component(message: impl Into<String>) -> Self {
        Self::Component(message.into())
    }

    pub fn component_not_found(component: impl Into<String>) -> Self {
        Self::ComponentNotFound {
            component: component.into(),
        }
    }

    pub fn node_not_found(node: impl Into<String>) -> Self {
        Self::NodeNotFound { node: node.into() }
    }

    pub fn no_component(node: impl Into<String>) -> Self {
        Self::NoComponent { node: node.into() }
    }

    pub fn port_not_found(
        node: impl Into<String>,
        port: impl Into<String>,
        direction: PortDirection,
    ) -> Self {
        Self::PortNotFound {
            node: node.into(),
            port: port.into(),
            direction,
        }
    }

    pub fn addressing(message: impl Into<String>) -> Self {
        Self::AddressingMismatch {
            message: message.into(),
        }
    }

    pub fn lifecycle(node: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Lifecycle {
            node: node.into(),
            message: message.to_string(),
        }
    }

    /// Whether this failure was already wrapped by a socket
    pub fn is_wrapped(&self) -> bool {
        matches!(self, FlowError::Process(_))
    }

    /// Unwrap a socket-wrapped failure into the original component error
    pub fn root_cause(&self) -> &FlowError {
        match self {
            FlowError::Process(failure) => failure.error.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_failure_message() {
        let failure = ProcessFailure {
            id: "Split".to_string(),
            metadata: Value::Null,
            subgraph: vec!["Outer".to_string(), "Inner".to_string()],
            error: Box::new(FlowError::component("boom")),
        };
        let err = FlowError::Process(failure);
        assert!(err.is_wrapped());
        assert_eq!(
            err.to_string(),
            "process `Split` in subgraph Outer/Inner failed: boom"
        );
        assert!(matches!(err.root_cause(), FlowError::Component(msg) if msg == "boom"));
    }

    #[test]
    fn test_wiring_messages() {
        let err = FlowError::port_not_found("A", "missing", PortDirection::In);
        assert_eq!(err.to_string(), "no inport `missing` defined in process `A`");
        assert!(!err.is_wrapped());
    }
}
