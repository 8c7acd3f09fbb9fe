//! SCP wire protocol definitions
// (c) 2024 Ross Younger
//!
//! The SCP protocol multiplexes two kinds of traffic on the one
//! bidirectional SSH channel byte stream:
//!
//! * single-byte acknowledgements, and
//! * newline-terminated ASCII control lines.
//!
//! The acknowledgement bytes are:
//!
//! | byte | meaning |
//! |------|---------|
//! | 0x00 | OK / continue |
//! | 0x01 | WARN, followed by diagnostic text up to 0x0A |
//! | 0x02 | ERR, followed by diagnostic text up to 0x0A |
//!
//! The control lines are described by [`ProtocolMessage`].
//!
//! Handshakes (all acks flow opposite to the data they acknowledge):
//!
//! * Upload, per file: server ➡️ OK, peer ➡️ `C… \n`, server ➡️ OK,
//!   peer ➡️ payload bytes, peer ➡️ OK, server ➡️ OK.
//! * Upload, per directory: peer ➡️ `D… \n`, server ➡️ OK, …contents…,
//!   peer ➡️ `E\n`, server ➡️ OK.
//! * Download, per file: peer ➡️ OK, server ➡️ `C… \n`, peer ➡️ OK,
//!   server ➡️ payload bytes, server ➡️ OK, peer ➡️ OK.
//! * Download, per directory: server ➡️ `D… \n`, peer ➡️ OK, …contents…,
//!   server ➡️ `E\n`, peer ➡️ OK.
//!
//! A `T` (timestamp) line may precede any `C` or `D` when the peer asked
//! for times to be preserved; it is acknowledged like any other control
//! line.

mod message;
pub use message::{format_file_mode, ProtocolMessage};

/// OK / continue.
pub const OK: u8 = 0x00;
/// Warning; diagnostic text up to the next newline follows.
pub const WARN: u8 = 0x01;
/// Fatal error; diagnostic text up to the next newline follows.
pub const ERR: u8 = 0x02;
/// Control line terminator.
pub const NEWLINE: u8 = 0x0A;
