//! Ping/pong and idle keep-alive writers.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tracing::debug;

use crate::connection::WriterId;
use crate::connection::shared::Shared;
use crate::connection::write_op::WriteOp;
use crate::error::{Error, Result};
use crate::protocol::OpCode;

/// An explicit ping or pong. Both share the `Ping` writer slot.
pub(crate) struct PingOp<W> {
    op: WriteOp<W>,
    frame: Bytes,
}

impl<W> PingOp<W> {
    /// Validate and serialize the frame before the lock is touched.
    ///
    /// # Errors
    ///
    /// `Error::ControlFrameTooLarge` if `payload` exceeds 125 bytes.
    pub(crate) fn new(shared: &Arc<Shared<W>>, opcode: OpCode, payload: &[u8]) -> Result<Self> {
        debug_assert!(matches!(opcode, OpCode::Ping | OpCode::Pong));
        let frame = shared.encode_control(opcode, payload)?;
        Ok(Self {
            op: WriteOp::new(Arc::downgrade(shared), WriterId::Ping),
            frame,
        })
    }
}

impl<W: AsyncWrite + Unpin> PingOp<W> {
    pub(crate) async fn run(self) -> Result<()> {
        let Self { op, frame } = self;
        op.run(frame).await
    }
}

/// A keep-alive ping with an empty payload.
///
/// Holding one of these means the idle flag is set; it is cleared when the
/// op finishes or is dropped.
pub(crate) struct IdlePingOp<W> {
    op: WriteOp<W>,
    frame: Bytes,
}

impl<W> IdlePingOp<W> {
    /// Returns `None` when an idle ping is already in flight. Nothing is
    /// serialized and the lock is not touched in that case.
    pub(crate) fn start(shared: &Arc<Shared<W>>) -> Option<Self> {
        if !shared.begin_idle_ping() {
            let suppressed = Error::AlreadyInProgress(WriterId::IdlePing);
            debug!(error = %suppressed, "idle ping suppressed");
            return None;
        }
        Some(Self {
            op: WriteOp::new(Arc::downgrade(shared), WriterId::IdlePing),
            frame: shared.encode(OpCode::Ping, &[]),
        })
    }
}

impl<W: AsyncWrite + Unpin> IdlePingOp<W> {
    /// Failures are logged and left in the connection's last error.
    pub(crate) async fn run(self) {
        let Self { op, frame } = self;
        match op.run(frame).await {
            Ok(()) => debug!("idle ping sent"),
            Err(err) => debug!(error = %err, "idle ping failed"),
        }
    }
}
