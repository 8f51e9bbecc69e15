// ABOUTME: Single-file upload through a remote `scp -t` receiver.
// ABOUTME: Frames header line, exact payload bytes and a NUL terminator onto the session stdin.

use crate::relay::drain;
use crate::ssh::{self, Session, Transport, quote};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Mode used for in-memory payloads.
pub const DEFAULT_MODE: u32 = 0o664;

/// How long to wait for the receiver's acknowledgements after the upload.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest header line `receive` accepts, newline included.
const MAX_HEADER_LEN: u64 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid file name {0:?}: must be a plain name without '/' or newline")]
    InvalidName(String),

    #[error("source ended after {got} of {expected} bytes")]
    ShortSource { expected: u64, got: u64 },

    #[error("malformed copy header: {0}")]
    MalformedHeader(String),

    #[error("remote scp refused the file: {0}")]
    Remote(String),

    #[error("remote session has no streams")]
    NoStreams,

    #[error(transparent)]
    Ssh(#[from] ssh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Metadata line sent before the file body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyHeader {
    pub mode: u32,
    pub length: u64,
    pub name: String,
}

impl CopyHeader {
    pub fn new(mode: u32, length: u64, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains('/') || name.contains('\n') {
            return Err(Error::InvalidName(name));
        }
        Ok(Self { mode, length, name })
    }

    /// `C<mode> <length> <name>\n`.
    pub fn encode(&self) -> String {
        format!("C{} {} {}\n", octal_mode(self.mode), self.length, self.name)
    }

    /// Parse a header line, with or without its trailing newline.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let rest = line
            .strip_prefix('C')
            .ok_or_else(|| Error::MalformedHeader(line.to_string()))?;
        let mut parts = rest.splitn(3, ' ');
        let (Some(mode), Some(length), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::MalformedHeader(line.to_string()));
        };
        let mode = u32::from_str_radix(mode, 8)
            .map_err(|_| Error::MalformedHeader(format!("bad mode {:?}", mode)))?;
        let length = length
            .parse::<u64>()
            .map_err(|_| Error::MalformedHeader(format!("bad length {:?}", length)))?;
        Self::new(mode, length, name)
    }
}

/// Permission bits in octal with one leading zero and at least four digits:
/// `0644`, `04755`.
fn octal_mode(mode: u32) -> String {
    format!("0{:03o}", mode & 0o7777)
}

/// Write one framed file to `writer` and shut it down.
///
/// Exactly `header.length` bytes are taken from `source`; a shorter source is
/// an error after whatever it did provide has been written.
pub async fn send<W, R>(writer: &mut W, header: &CopyHeader, source: R) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + Unpin,
{
    writer.write_all(header.encode().as_bytes()).await?;
    let copied = tokio::io::copy(&mut source.take(header.length), writer).await?;
    if copied != header.length {
        return Err(Error::ShortSource {
            expected: header.length,
            got: copied,
        });
    }
    writer.write_all(&[0]).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Read one framed file: header line, body and terminator.
pub async fn receive<R>(reader: &mut R) -> Result<(CopyHeader, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    (&mut reader).take(MAX_HEADER_LEN).read_line(&mut line).await?;
    if !line.ends_with('\n') {
        return Err(Error::MalformedHeader(format!(
            "header line unterminated after {} bytes",
            line.len()
        )));
    }
    let header = CopyHeader::parse(&line)?;

    // The body grows as it arrives; the declared length is only an upper bound.
    let mut body = Vec::new();
    let got = (&mut reader)
        .take(header.length)
        .read_to_end(&mut body)
        .await? as u64;
    if got != header.length {
        return Err(Error::ShortSource {
            expected: header.length,
            got,
        });
    }
    let mut terminator = [0u8; 1];
    reader.read_exact(&mut terminator).await?;
    if terminator[0] != 0 {
        return Err(Error::MalformedHeader(format!(
            "expected NUL terminator, got {:#04x}",
            terminator[0]
        )));
    }
    Ok((header, body))
}

/// Find the first error in the receiver's acknowledgement stream.
///
/// Each ack is a NUL byte, or 1 (warning) / 2 (fatal) followed by a message line.
fn check_acks(acks: &[u8]) -> Result<()> {
    let mut rest = acks;
    while let Some((&code, tail)) = rest.split_first() {
        match code {
            0 => rest = tail,
            1 | 2 => {
                let end = tail.iter().position(|&b| b == b'\n').unwrap_or(tail.len());
                return Err(Error::Remote(
                    String::from_utf8_lossy(&tail[..end]).trim().to_string(),
                ));
            }
            _ => return Ok(()),
        }
    }
    Ok(())
}

/// Upload one file into `destination` on the remote host.
///
/// Returns once the payload and terminator are written, the write side is
/// closed and the session has been closed.
pub async fn copy<T, R>(
    transport: &T,
    header: &CopyHeader,
    destination: &str,
    source: R,
) -> Result<()>
where
    T: Transport,
    R: AsyncRead + Unpin,
{
    let mut session = transport.open_session().await?;
    let result = copy_in_session(&mut session, header, destination, source).await;
    let closed = session.close().await;
    result?;
    closed?;
    tracing::info!(
        name = %header.name,
        bytes = header.length,
        destination,
        "Copied file"
    );
    Ok(())
}

async fn copy_in_session<S, R>(
    session: &mut S,
    header: &CopyHeader,
    destination: &str,
    source: R,
) -> Result<()>
where
    S: Session,
    R: AsyncRead + Unpin,
{
    let mut streams = session.take_streams().ok_or(Error::NoStreams)?;
    session
        .start(&format!("scp -t {}", quote(destination)))
        .await?;

    // Stderr is only read so a chatty receiver never stalls on a full pipe.
    let stop = CancellationToken::new();
    let mut stderr = streams.stderr;
    let stderr_stop = stop.clone();
    let stderr_task = tokio::spawn(async move { drain(&mut stderr, &stderr_stop).await.0 });

    let sent = send(&mut streams.stdin, header, source).await;

    let acks = if sent.is_ok() {
        let ack_stop = stop.clone();
        tokio::time::timeout(ACK_TIMEOUT, drain(&mut streams.stdout, &ack_stop))
            .await
            .map(|(acks, _)| acks)
            .unwrap_or_else(|_| {
                tracing::debug!("No scp acknowledgement within {:?}", ACK_TIMEOUT);
                Vec::new()
            })
    } else {
        Vec::new()
    };

    stop.cancel();
    if let Ok(errors) = stderr_task.await {
        let text = String::from_utf8_lossy(&errors);
        if !text.trim().is_empty() {
            tracing::debug!("scp stderr: {}", text.trim());
        }
    }

    sent?;
    check_acks(&acks)
}

/// Upload an in-memory buffer with mode 0664.
pub async fn copy_bytes<T: Transport>(
    transport: &T,
    name: &str,
    destination: &str,
    data: &[u8],
) -> Result<()> {
    copy_bytes_with_mode(transport, DEFAULT_MODE, name, destination, data).await
}

pub async fn copy_bytes_with_mode<T: Transport>(
    transport: &T,
    mode: u32,
    name: &str,
    destination: &str,
    data: &[u8],
) -> Result<()> {
    let header = CopyHeader::new(mode, data.len() as u64, name)?;
    copy(transport, &header, destination, data).await
}

/// Upload a local file under its own name, keeping its permission bits.
pub async fn copy_file<T: Transport>(transport: &T, path: &Path, destination: &str) -> Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidName(path.display().to_string()))?;

    let file = tokio::fs::File::open(path).await?;
    let metadata = file.metadata().await?;
    let header = CopyHeader::new(permission_bits(&metadata), metadata.len(), name)?;
    copy(transport, &header, destination, file).await
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        DEFAULT_MODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_renders_octal_mode() {
        let header = CopyHeader::new(0o644, 5, "hello.txt").unwrap();
        assert_eq!(header.encode(), "C0644 5 hello.txt\n");
        assert_eq!(
            CopyHeader::new(0o4755, 0, "run").unwrap().encode(),
            "C04755 0 run\n"
        );
        assert_eq!(
            CopyHeader::new(0o7, 0, "x").unwrap().encode(),
            "C0007 0 x\n"
        );
    }

    #[test]
    fn names_with_slashes_or_newlines_are_rejected() {
        assert!(matches!(
            CopyHeader::new(0o644, 1, "etc/passwd"),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            CopyHeader::new(0o644, 1, "a\nC0777 1 b"),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn parse_reads_back_an_encoded_header() {
        let header = CopyHeader::parse("C0600 42 id_ed25519\n").unwrap();
        assert_eq!(header, CopyHeader::new(0o600, 42, "id_ed25519").unwrap());
        assert!(CopyHeader::parse("D0755 0 dir\n").is_err());
    }

    #[tokio::test]
    async fn send_frames_exact_bytes() {
        let header = CopyHeader::new(0o644, 5, "hello.txt").unwrap();
        let mut out = Vec::new();
        send(&mut out, &header, &b"hello world"[..]).await.unwrap();
        assert_eq!(out, b"C0644 5 hello.txt\nhello\0");
    }

    #[tokio::test]
    async fn short_source_is_an_error() {
        let header = CopyHeader::new(0o644, 10, "short").unwrap();
        let mut out = Vec::new();
        let err = send(&mut out, &header, &b"abc"[..]).await.unwrap_err();
        assert!(matches!(err, Error::ShortSource { expected: 10, got: 3 }));
    }

    #[tokio::test]
    async fn huge_declared_length_is_a_short_body_not_a_panic() {
        let mut wire = &b"C0644 18446744073709551615 x\nabc"[..];
        let err = receive(&mut wire).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ShortSource {
                expected: u64::MAX,
                got: 3
            }
        ));
    }

    #[tokio::test]
    async fn unterminated_header_is_malformed() {
        let long = vec![b'C'; 8192];
        let err = receive(&mut &long[..]).await.unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(_)));

        let err = receive(&mut &b"C0644 1 x"[..]).await.unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(_)));
    }

    #[test]
    fn acks_report_remote_errors() {
        assert!(check_acks(b"\0\0\0").is_ok());
        let err = check_acks(b"\0\x01scp: /root/x: Permission denied\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "remote scp refused the file: scp: /root/x: Permission denied"
        );
    }

    proptest! {
        #[test]
        fn header_is_one_line_with_zero_led_octal_mode(
            mode in 0u32..0o10000,
            length in any::<u64>(),
            name in "[A-Za-z0-9._ -]{1,32}",
        ) {
            let line = CopyHeader::new(mode, length, name.clone()).unwrap().encode();
            prop_assert!(line.starts_with('C'));
            prop_assert!(line.ends_with('\n'));
            prop_assert_eq!(line.matches('\n').count(), 1);
            let digits = line[1..].split(' ').next().unwrap();
            prop_assert!(digits.len() >= 4);
            prop_assert!(digits.starts_with('0'));
            prop_assert!(!digits.starts_with("00") || mode < 0o100);
            prop_assert_eq!(u32::from_str_radix(digits, 8).unwrap(), mode);
            prop_assert_eq!(CopyHeader::parse(&line).unwrap().mode, mode);
        }
    }
}
