//! SCP control line parsing and formatting
// (c) 2024 Ross Younger

use std::fmt::Display;

use crate::error::ScpError;

/// One newline-terminated SCP control line.
///
/// ```text
/// C0644 6 testfile
/// D0755 0 testdir
/// E
/// T1708363200 0 1708363200 0
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    /// `C<mode> <size> <name>`: a regular file header. Payload bytes of
    /// exactly `size` follow the acknowledgement.
    File { mode: u32, size: u64, name: String },
    /// `D<mode> 0 <name>`: descend into a directory.
    Dir { mode: u32, name: String },
    /// `E`: ascend out of the current directory.
    EndDir,
    /// `T<mtime> 0 <atime> 0`: timestamps (seconds) for the next entry.
    Times { mtime: i64, atime: i64 },
    /// An empty line. Never valid, but distinguished so the engines can
    /// report it precisely.
    Empty,
}

impl ProtocolMessage {
    /// Classifies one line read from the channel (without its trailing
    /// newline).
    pub fn parse(line: &str) -> Result<Self, ScpError> {
        match line.as_bytes().first() {
            None => Ok(ProtocolMessage::Empty),
            // The openssh client only ever sends a bare "E", but match on
            // the leading byte alone as the reference servers do.
            Some(b'E') => Ok(ProtocolMessage::EndDir),
            Some(b'T') => parse_times(line),
            Some(b'C' | b'D') => parse_entry(line),
            Some(_) => Err(ScpError::Protocol(format!(
                "unknown or invalid upload message: {line:?}"
            ))),
        }
    }
}

fn parse_entry(line: &str) -> Result<ProtocolMessage, ScpError> {
    let mut parts = line.splitn(3, ' ');
    let head = parts.next().unwrap_or_default();
    let (Some(size_str), Some(name)) = (parts.next(), parts.next()) else {
        return Err(ScpError::Protocol(format!(
            "unable to split upload message: {line:?}"
        )));
    };

    let mode_str = &head[1..];
    if mode_str.is_empty() || mode_str.len() > 4 {
        return Err(ScpError::Protocol(format!(
            "invalid file mode in upload message: {line:?}"
        )));
    }
    let mode = u32::from_str_radix(mode_str, 8).map_err(|_| {
        ScpError::Protocol(format!("invalid file mode in upload message: {line:?}"))
    })?;

    let size: u64 = size_str.parse().map_err(|_| {
        ScpError::Protocol(format!("invalid size in upload message: {line:?}"))
    })?;

    if name.is_empty() {
        return Err(ScpError::Protocol(
            "error getting name from upload message, cannot be empty".into(),
        ));
    }

    Ok(if line.starts_with('D') {
        ProtocolMessage::Dir {
            mode,
            name: name.to_string(),
        }
    } else {
        ProtocolMessage::File {
            mode,
            size,
            name: name.to_string(),
        }
    })
}

fn parse_times(line: &str) -> Result<ProtocolMessage, ScpError> {
    // T<mtime> 0 <atime> 0
    let parts: Vec<&str> = line.split(' ').collect();
    let invalid = || ScpError::Protocol(format!("invalid time message: {line:?}"));
    if parts.len() != 4 {
        return Err(invalid());
    }
    let mtime: i64 = parts[0][1..].parse().map_err(|_| invalid())?;
    let atime: i64 = parts[2].parse().map_err(|_| invalid())?;
    Ok(ProtocolMessage::Times { mtime, atime })
}

impl Display for ProtocolMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolMessage::File { mode, size, name } => {
                write!(f, "C{} {size} {name}", format_file_mode(*mode, false))
            }
            ProtocolMessage::Dir { mode, name } => {
                write!(f, "D{} 0 {name}", format_file_mode(*mode, true))
            }
            ProtocolMessage::EndDir => f.write_str("E"),
            ProtocolMessage::Times { mtime, atime } => {
                write!(f, "T{mtime} 0 {atime} 0")
            }
            ProtocolMessage::Empty => Ok(()),
        }
    }
}

/// Renders a unix permission word as the four octal digits SCP expects.
///
/// Backends with no mode concept report zero; that falls back to `0755`
/// for directories and `0644` for files. Setuid, setgid and sticky fold
/// into the leading digit.
#[must_use]
pub fn format_file_mode(mode: u32, is_dir: bool) -> String {
    let bits = mode & 0o7777;
    if bits == 0 {
        let fallback = if is_dir { "0755" } else { "0644" };
        return fallback.to_string();
    }
    format!("{bits:04o}")
}
