// (c) 2024 Ross Younger

//! `scpd` is the server side of the SCP protocol, packaged as an engine
//! an SSH server embeds: when a client runs `scp` against your server,
//! this crate speaks the wire protocol on the channel.
//!
//! ## Overview
//! - 🔌 Transport-agnostic: drive it with any SSH server crate; the
//!   channel is just a byte stream plus exit-status/close (see
//!   [`channel::SessionChannel`])
//! - 🗂️ Storage-agnostic: all file access goes through the [`vfs::Fs`]
//!   trait, so local disk, object storage and encrypted overlays all
//!   look the same to the protocol code
//! - 🛡️ Policy enforced before bytes flow: per-path permissions,
//!   file-pattern rules, transfer-count limits, disk and transfer-byte
//!   quotas and a pre-action veto hook all run before any payload is
//!   accepted or served
//! - 🔁 Full recursive transfers in both directions, including
//!   virtual-folder mount points injected into directory listings
//!
//! ## 📖 How it works
//!
//! The brief version:
//! 1. Your SSH server accepts an exec request of the form `scp -t …` or
//!    `scp -f …` and splits it into argv
//! 1. You call [`scp::handle`] with the argv, the authenticated
//!    [`access::User`], your [`services::SessionServices`] and the
//!    channel
//! 1. The engine runs the SCP state machine to completion, sends the
//!    exit status, and returns it
//!
//! Uploads (`-t`) are driven by the peer: it announces files and
//! directories with control lines, we check policy, create and stream.
//! Downloads (`-f`) are driven by us: we walk the tree and emit the
//! same control lines the other way. Every step is punctuated by a
//! single-byte acknowledgement; see [`protocol`] for the wire format.
//!
//! Failure handling is deliberately blunt, as the protocol demands: any
//! protocol-level failure sends an ERR ack with a diagnostic and closes
//! the channel.
//!
//! ## What scpd is not
//!
//! * An SSH server (bring your own; anything that yields an
//!   `AsyncRead + AsyncWrite` channel works)
//! * An SCP *client*
//! * An SFTP implementation — though the same [`vfs::Fs`] and
//!   [`access::User`] implementations can back one
//!
//! ## MSRV policy
//!
//! The MSRV may be upgraded from time to time to take advantage of new
//! language features.

pub mod access;
pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod scp;
pub mod services;
pub mod transfer;
pub mod util;
pub mod vfs;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::ScpConfig;
pub use error::ScpError;
pub use scp::handle;
