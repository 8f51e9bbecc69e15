// ABOUTME: Wire decoding of in-band session channel requests and channel open types.
// ABOUTME: Payloads are big-endian SSH wire data; truncated input is an error, never a panic.

use crate::pty::TermSize;
use thiserror::Error;

/// The only channel type this server accepts.
pub const SESSION_CHANNEL: &str = "session";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("unknown channel type: {0}")]
    UnknownChannelType(String),

    #[error("{request} payload truncated: need {needed} bytes, got {got}")]
    Truncated {
        request: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("shell request with a command is not supported")]
    ShellCommand,
}

/// Check a channel open type. Anything but `session` is rejected.
pub fn check_channel_type(kind: &str) -> Result<(), RequestError> {
    if kind == SESSION_CHANNEL {
        Ok(())
    } else {
        Err(RequestError::UnknownChannelType(kind.to_string()))
    }
}

/// A decoded in-band request on a session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    /// Bare login shell.
    Shell,
    PtyReq { term: String, size: TermSize },
    WindowChange(TermSize),
    /// Anything else (`exec`, `env`, `subsystem`, ...).
    Unsupported(String),
}

impl ChannelRequest {
    pub fn decode(kind: &str, payload: &[u8]) -> Result<Self, RequestError> {
        match kind {
            "shell" if payload.is_empty() => Ok(Self::Shell),
            "shell" => Err(RequestError::ShellCommand),
            "pty-req" => decode_pty_req(payload),
            "window-change" => {
                decode_dims("window-change", payload).map(Self::WindowChange)
            }
            other => Ok(Self::Unsupported(other.to_string())),
        }
    }
}

fn read_u32(payload: &[u8], offset: usize, request: &'static str) -> Result<u32, RequestError> {
    let end = offset.checked_add(4).ok_or(RequestError::Truncated {
        request,
        needed: usize::MAX,
        got: payload.len(),
    })?;
    let bytes = payload.get(offset..end).ok_or(RequestError::Truncated {
        request,
        needed: end,
        got: payload.len(),
    })?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn decode_dims(request: &'static str, payload: &[u8]) -> Result<TermSize, RequestError> {
    let width = read_u32(payload, 0, request)?;
    let height = read_u32(payload, 4, request)?;
    Ok(TermSize::new(width, height))
}

// [u32 term len][term][u32 width][u32 height][u32 px width][u32 px height][modes]
fn decode_pty_req(payload: &[u8]) -> Result<ChannelRequest, RequestError> {
    let term_len = read_u32(payload, 0, "pty-req")? as usize;
    let dims_at = 4usize.checked_add(term_len).ok_or(RequestError::Truncated {
        request: "pty-req",
        needed: usize::MAX,
        got: payload.len(),
    })?;
    let term = payload.get(4..dims_at).ok_or(RequestError::Truncated {
        request: "pty-req",
        needed: dims_at,
        got: payload.len(),
    })?;
    let size = decode_dims("pty-req", &payload[dims_at..])?;
    Ok(ChannelRequest::PtyReq {
        term: String::from_utf8_lossy(term).into_owned(),
        size,
    })
}

/// Encode a `pty-req` payload. Terminal modes are sent empty.
pub fn encode_pty_req(term: &str, size: TermSize, pixels: (u32, u32)) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + term.len() + 20);
    out.extend_from_slice(&(term.len() as u32).to_be_bytes());
    out.extend_from_slice(term.as_bytes());
    out.extend_from_slice(&size.width.to_be_bytes());
    out.extend_from_slice(&size.height.to_be_bytes());
    out.extend_from_slice(&pixels.0.to_be_bytes());
    out.extend_from_slice(&pixels.1.to_be_bytes());
    // Empty mode list: just the TTY_OP_END opcode wrapped in a string.
    out.extend_from_slice(&1u32.to_be_bytes());
    out.push(0);
    out
}

/// Encode a `window-change` payload.
pub fn encode_window_change(size: TermSize, pixels: (u32, u32)) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&size.width.to_be_bytes());
    out.extend_from_slice(&size.height.to_be_bytes());
    out.extend_from_slice(&pixels.0.to_be_bytes());
    out.extend_from_slice(&pixels.1.to_be_bytes());
    out
}

/// Encode an SSH `string`: u32 length then bytes.
pub fn encode_string(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + value.len());
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn only_session_channels_pass() {
        assert!(check_channel_type("session").is_ok());
        let err = check_channel_type("direct-tcpip").unwrap_err();
        assert_eq!(err.to_string(), "unknown channel type: direct-tcpip");
    }

    #[test]
    fn window_change_reads_from_offset_zero() {
        let payload = [0, 0, 0, 0x78, 0, 0, 0, 0x28];
        assert_eq!(
            ChannelRequest::decode("window-change", &payload).unwrap(),
            ChannelRequest::WindowChange(TermSize::new(120, 40))
        );
    }

    #[test]
    fn pty_req_skips_the_term_name() {
        let payload = encode_pty_req("xterm-256color", TermSize::new(80, 24), (640, 480));
        assert_eq!(
            ChannelRequest::decode("pty-req", &payload).unwrap(),
            ChannelRequest::PtyReq {
                term: "xterm-256color".to_string(),
                size: TermSize::new(80, 24),
            }
        );
    }

    #[test]
    fn pty_req_uses_the_full_length_field() {
        // 300-byte term name: the length does not fit in the low byte alone.
        let term = "x".repeat(300);
        let payload = encode_pty_req(&term, TermSize::new(132, 50), (0, 0));
        let ChannelRequest::PtyReq { term: decoded, size } =
            ChannelRequest::decode("pty-req", &payload).unwrap()
        else {
            panic!("expected pty-req");
        };
        assert_eq!(decoded.len(), 300);
        assert_eq!(size, TermSize::new(132, 50));
    }

    #[test]
    fn truncated_payloads_are_errors() {
        assert!(matches!(
            ChannelRequest::decode("window-change", &[0, 0, 0, 80, 0]),
            Err(RequestError::Truncated { .. })
        ));
        assert!(matches!(
            ChannelRequest::decode("pty-req", &[0, 0, 0, 200, b'x']),
            Err(RequestError::Truncated { .. })
        ));
        assert!(matches!(
            ChannelRequest::decode("pty-req", &[0xff, 0xff, 0xff, 0xff]),
            Err(RequestError::Truncated { .. })
        ));
    }

    #[test]
    fn shell_with_command_is_refused() {
        assert_eq!(ChannelRequest::decode("shell", &[]).unwrap(), ChannelRequest::Shell);
        assert_eq!(
            ChannelRequest::decode("shell", &encode_string(b"ls")),
            Err(RequestError::ShellCommand)
        );
    }

    #[test]
    fn other_requests_are_unsupported() {
        assert_eq!(
            ChannelRequest::decode("exec", &encode_string(b"uptime")).unwrap(),
            ChannelRequest::Unsupported("exec".to_string())
        );
    }

    proptest! {
        #[test]
        fn decoders_never_panic(payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = ChannelRequest::decode("pty-req", &payload);
            let _ = ChannelRequest::decode("window-change", &payload);
            let _ = ChannelRequest::decode("shell", &payload);
        }

        #[test]
        fn window_change_round_trips(width in any::<u32>(), height in any::<u32>()) {
            let payload = encode_window_change(TermSize::new(width, height), (0, 0));
            prop_assert_eq!(
                ChannelRequest::decode("window-change", &payload).unwrap(),
                ChannelRequest::WindowChange(TermSize::new(width, height))
            );
        }
    }
}
