//! Named device properties ("nodes") and the node-map trait.
//!
//! A node map never raises on an absent or locked node: callers query
//! [`NodeMap::access`] first and every read/write returns a [`NodeError`]
//! that the caller degrades to a warning.

use std::fmt;
use thiserror::Error;

/// The device properties this crate reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    DeviceVendorName,
    DeviceModelName,
    DeviceSerialNumber,
    PixelFormat,
    AcquisitionMode,
    Width,
    Height,
    OffsetX,
    OffsetY,
    AcquisitionFrameRateEnable,
    AcquisitionFrameRate,
}

impl Node {
    pub const ALL: [Node; 11] = [
        Node::DeviceVendorName,
        Node::DeviceModelName,
        Node::DeviceSerialNumber,
        Node::PixelFormat,
        Node::AcquisitionMode,
        Node::Width,
        Node::Height,
        Node::OffsetX,
        Node::OffsetY,
        Node::AcquisitionFrameRateEnable,
        Node::AcquisitionFrameRate,
    ];

    /// GenICam feature name.
    pub fn name(self) -> &'static str {
        match self {
            Node::DeviceVendorName => "DeviceVendorName",
            Node::DeviceModelName => "DeviceModelName",
            Node::DeviceSerialNumber => "DeviceSerialNumber",
            Node::PixelFormat => "PixelFormat",
            Node::AcquisitionMode => "AcquisitionMode",
            Node::Width => "Width",
            Node::Height => "Height",
            Node::OffsetX => "OffsetX",
            Node::OffsetY => "OffsetY",
            Node::AcquisitionFrameRateEnable => "AcquisitionFrameRateEnable",
            Node::AcquisitionFrameRate => "AcquisitionFrameRate",
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Readability/writability of a node at this moment.
///
/// Access can change over time, e.g. `Width` is writable before
/// acquisition starts and read-only while streaming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Access {
    pub readable: bool,
    pub writable: bool,
}

impl Access {
    pub const NONE: Access = Access {
        readable: false,
        writable: false,
    };
    pub const READ_ONLY: Access = Access {
        readable: true,
        writable: false,
    };
    pub const READ_WRITE: Access = Access {
        readable: true,
        writable: true,
    };

    pub fn is_available(self) -> bool {
        self.readable || self.writable
    }
}

/// A typed node value.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Symbolic name of an enumeration entry.
    Enum(String),
}

impl NodeValue {
    /// Type name used in mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeValue::Int(_) => "integer",
            NodeValue::Float(_) => "float",
            NodeValue::Bool(_) => "boolean",
            NodeValue::Str(_) => "string",
            NodeValue::Enum(_) => "enumeration",
        }
    }
}

impl fmt::Display for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeValue::Int(v) => write!(f, "{v}"),
            NodeValue::Float(v) => write!(f, "{v:.2}"),
            NodeValue::Bool(v) => write!(f, "{v}"),
            NodeValue::Str(s) | NodeValue::Enum(s) => f.write_str(s),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("node {0} is not available on this device")]
    NotAvailable(Node),
    #[error("node {0} is not readable")]
    NotReadable(Node),
    #[error("node {0} is not writable")]
    NotWritable(Node),
    #[error("node {node} holds a {actual} value, expected {expected}")]
    TypeMismatch {
        node: Node,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("device rejected write to {node}: {reason}")]
    Rejected { node: Node, reason: String },
}

/// Per-named-property access to a device.
pub trait NodeMap {
    /// Current access flags. Absent nodes report [`Access::NONE`].
    fn access(&self, node: Node) -> Access;

    /// Current value.
    fn read(&self, node: Node) -> Result<NodeValue, NodeError>;

    /// Upper bound for numeric nodes.
    fn max(&self, node: Node) -> Result<NodeValue, NodeError>;

    fn write(&mut self, node: Node, value: NodeValue) -> Result<(), NodeError>;

    /// Readable entries of an enumeration node (symbolic names).
    fn entries(&self, node: Node) -> Result<Vec<String>, NodeError>;

    fn is_readable(&self, node: Node) -> bool {
        self.access(node).readable
    }

    fn is_writable(&self, node: Node) -> bool {
        self.access(node).writable
    }

    fn read_int(&self, node: Node) -> Result<i64, NodeError> {
        match self.read(node)? {
            NodeValue::Int(v) => Ok(v),
            other => Err(mismatch(node, "integer", &other)),
        }
    }

    fn max_int(&self, node: Node) -> Result<i64, NodeError> {
        match self.max(node)? {
            NodeValue::Int(v) => Ok(v),
            other => Err(mismatch(node, "integer", &other)),
        }
    }

    fn read_float(&self, node: Node) -> Result<f64, NodeError> {
        match self.read(node)? {
            NodeValue::Float(v) => Ok(v),
            other => Err(mismatch(node, "float", &other)),
        }
    }

    fn max_float(&self, node: Node) -> Result<f64, NodeError> {
        match self.max(node)? {
            NodeValue::Float(v) => Ok(v),
            other => Err(mismatch(node, "float", &other)),
        }
    }

    /// String or enumeration value as text.
    fn read_text(&self, node: Node) -> Result<String, NodeError> {
        match self.read(node)? {
            NodeValue::Str(s) | NodeValue::Enum(s) => Ok(s),
            other => Err(mismatch(node, "string", &other)),
        }
    }
}

fn mismatch(node: Node, expected: &'static str, actual: &NodeValue) -> NodeError {
    NodeError::TypeMismatch {
        node,
        expected,
        actual: actual.kind(),
    }
}

/// Read a text node, falling back to `"Unknown"` when it is not readable.
pub fn text_or_unknown(nodes: &dyn NodeMap, node: Node) -> String {
    if !nodes.is_readable(node) {
        return "Unknown".to_string();
    }
    nodes
        .read_text(node)
        .unwrap_or_else(|_| "Unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneInt;

    impl NodeMap for OneInt {
        fn access(&self, node: Node) -> Access {
            match node {
                Node::Width => Access::READ_ONLY,
                _ => Access::NONE,
            }
        }
        fn read(&self, node: Node) -> Result<NodeValue, NodeError> {
            match node {
                Node::Width => Ok(NodeValue::Int(640)),
                other => Err(NodeError::NotAvailable(other)),
            }
        }
        fn max(&self, node: Node) -> Result<NodeValue, NodeError> {
            self.read(node)
        }
        fn write(&mut self, node: Node, _value: NodeValue) -> Result<(), NodeError> {
            Err(NodeError::NotWritable(node))
        }
        fn entries(&self, node: Node) -> Result<Vec<String>, NodeError> {
            Err(NodeError::NotAvailable(node))
        }
    }

    #[test]
    fn typed_read_reports_mismatch() {
        let nodes = OneInt;
        assert_eq!(nodes.read_int(Node::Width), Ok(640));
        assert!(matches!(
            nodes.read_float(Node::Width),
            Err(NodeError::TypeMismatch {
                expected: "float",
                actual: "integer",
                ..
            })
        ));
    }

    #[test]
    fn unreadable_text_is_unknown() {
        let nodes = OneInt;
        assert_eq!(text_or_unknown(&nodes, Node::DeviceModelName), "Unknown");
    }

    #[test]
    fn node_names_match_genicam() {
        assert_eq!(Node::AcquisitionFrameRateEnable.to_string(), "AcquisitionFrameRateEnable");
        assert_eq!(Node::OffsetY.name(), "OffsetY");
    }
}
