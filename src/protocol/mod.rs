//! WebSocket framing primitives (RFC 6455).

pub mod frame;
pub mod mask;
pub mod opcode;

pub use frame::{Frame, MAX_CONTROL_FRAME_PAYLOAD};
pub use mask::{MaskGenerator, apply_mask};
pub use opcode::OpCode;
