//! Tunnel control protocol
//!
//! The first client-to-server record of a session is a command frame: one
//! command byte followed by an ASCII `host:port` target. The server
//! answers with a single status record whose first byte is `0x00` on
//! success.

use thiserror::Error;

/// CONNECT command byte
pub const CMD_CONNECT: u8 = 0x01;

/// Server status: dial succeeded
pub const STATUS_OK: u8 = 0x00;

/// Server status: dial failed
pub const STATUS_FAILED: u8 = 0x01;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty command frame")]
    EmptyFrame,

    #[error("unknown command: {0:#04x}")]
    UnknownCommand(u8),

    #[error("target is not valid UTF-8")]
    InvalidTarget,
}

/// A parsed command frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Dial the given `host:port` and splice
    Connect(String),
}

impl Command {
    /// Encode for transmission as one tunnel record
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Connect(target) => {
                let mut frame = Vec::with_capacity(1 + target.len());
                frame.push(CMD_CONNECT);
                frame.extend_from_slice(target.as_bytes());
                frame
            }
        }
    }

    /// Parse a received command frame
    pub fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (&cmd, rest) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
        match cmd {
            CMD_CONNECT => {
                let target = std::str::from_utf8(rest)
                    .map_err(|_| ProtocolError::InvalidTarget)?
                    .to_string();
                Ok(Command::Connect(target))
            }
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_roundtrip() {
        let cmd = Command::Connect("example.com:443".to_string());
        let frame = cmd.encode();
        assert_eq!(frame[0], CMD_CONNECT);
        assert_eq!(&frame[1..], b"example.com:443");
        assert_eq!(Command::parse(&frame).unwrap(), cmd);
    }

    #[test]
    fn test_empty_frame() {
        assert!(matches!(
            Command::parse(&[]),
            Err(ProtocolError::EmptyFrame)
        ));
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            Command::parse(&[0x7f, b'x']),
            Err(ProtocolError::UnknownCommand(0x7f))
        ));
    }
}
