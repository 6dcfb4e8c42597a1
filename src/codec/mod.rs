//! Frame-level encoding and decoding for the connection's byte stream.
//!
//! [`FrameEncoder`] turns an opcode and payload into one ready-to-transmit
//! buffer; [`FrameReader`] parses frames off the read half.

mod encoder;
mod reader;

pub use encoder::FrameEncoder;
pub use reader::FrameReader;
