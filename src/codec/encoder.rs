use bytes::Bytes;

use crate::connection::Role;
use crate::error::{Error, Result};
use crate::protocol::{Frame, MAX_CONTROL_FRAME_PAYLOAD, MaskGenerator, OpCode};

/// Serializes outgoing frames for one side of a connection.
///
/// Clients mask every frame with a fresh key; servers never mask.
#[derive(Debug)]
pub struct FrameEncoder {
    role: Role,
    masks: MaskGenerator,
}

impl FrameEncoder {
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self::with_masks(role, MaskGenerator::new())
    }

    #[must_use]
    pub fn with_masks(role: Role, masks: MaskGenerator) -> Self {
        Self { role, masks }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Encode a single final frame.
    pub fn encode(&mut self, opcode: OpCode, payload: &[u8]) -> Bytes {
        let mask = self.role.must_mask().then(|| self.masks.next_mask());
        Frame::new(true, opcode, payload.to_vec()).encode(mask)
    }

    /// Encode a control frame, rejecting payloads over the protocol limit.
    ///
    /// # Errors
    ///
    /// Returns `Error::ControlFrameTooLarge` if `payload` exceeds 125 bytes.
    pub fn encode_control(&mut self, opcode: OpCode, payload: &[u8]) -> Result<Bytes> {
        debug_assert!(opcode.is_control());
        if payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
            return Err(Error::ControlFrameTooLarge(payload.len()));
        }
        Ok(self.encode(opcode, payload))
    }
}
