//! Small shared validation helpers used across services.

use snafu::Snafu;

/// Errors validating values shared across the device facade.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    /// A node id outside the valid `1..=127` range was used.
    #[snafu(display("node id {node_id} is outside the valid range 1..=127"))]
    InvalidNodeId {
        /// The rejected value.
        node_id: u8,
    },
}

/// Validate a CANopen node id is in `[1, 127]`.
pub fn validate_node_id(node_id: u8) -> Result<u8, ValidationError> {
    if (1..=127).contains(&node_id) {
        Ok(node_id)
    } else {
        Err(ValidationError::InvalidNodeId { node_id })
    }
}
