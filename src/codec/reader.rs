use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::Config;
use crate::connection::Role;
use crate::error::{Error, Result};
use crate::protocol::{Frame, OpCode};
use crate::protocol::frame::parse_header;

/// Reads and validates frames from the read half of a connection.
pub struct FrameReader<R> {
    io: R,
    read_buf: BytesMut,
    role: Role,
    config: Config,
}

impl<R> FrameReader<R> {
    #[must_use]
    pub fn new(io: R, role: Role, config: Config) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            role,
            config,
        }
    }

    #[must_use]
    pub fn into_inner(self) -> R {
        self.io
    }

    /// Check masking and size rules once the header is known.
    fn validate_header(&self) -> Result<()> {
        let header = match parse_header(&self.read_buf) {
            Ok(header) => header,
            Err(Error::IncompleteFrame { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        match (self.role.expects_masked(), header.mask.is_some()) {
            (true, false) if !self.config.accept_unmasked_frames => {
                return Err(Error::UnmaskedClientFrame);
            }
            (false, true) => return Err(Error::MaskedServerFrame),
            _ => {}
        }
        self.config.limits.check_frame_size(header.payload_len)
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read the next complete frame.
    ///
    /// # Errors
    ///
    /// - `Error::ConnectionClosed(None)` when the peer closes the stream
    /// - frame-level protocol errors
    /// - `Error::ProtocolViolation` for fragmented data frames
    /// - transport errors
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if self.read_buf.len() >= 2 {
                self.validate_header()?;

                match Frame::parse(&self.read_buf) {
                    Ok((frame, consumed)) => {
                        self.read_buf.advance(consumed);
                        frame.validate()?;
                        if !frame.fin || frame.opcode == OpCode::Continuation {
                            return Err(Error::ProtocolViolation(
                                "fragmented messages are not supported".into(),
                            ));
                        }
                        return Ok(frame);
                    }
                    Err(Error::IncompleteFrame { .. }) => {}
                    Err(e) => return Err(e),
                }
            }

            self.read_buf.reserve(4096);
            let n = self.io.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed(None));
            }
        }
    }
}
