//! Wire protocol between pool clients and heap servers.
//!
//! Every message is a [`Frame`], encoded as MessagePack inside a
//! length-prefixed, CRC32-checked envelope:
//!
//! ```text
//! +-------------+---------------------+-------------+
//! | len: u32 LE | payload (len bytes) | crc: u32 LE |
//! +-------------+---------------------+-------------+
//! ```

mod codec;
mod frame;

pub use codec::{decode_frame, encode_frame, read_frame, write_frame, MAX_FRAME_BYTES};
pub use frame::{CloseReason, Frame, PROTOCOL_VERSION};
