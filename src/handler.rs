//! Per-connection result handling.
//!
//! Each accepted connection goes through read, decode, report and close.
//! Read or decode failures skip the report step and are sent to the
//! diagnostic channel (`tracing`), never to the result log. The socket
//! is shut down in both directions on every path.

use bytes::BytesMut;
use socket2::SockRef;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::{Config, HeaderPolicy};
use crate::log_sink::LogSink;
use crate::packet::{self, DecodeError, TestResult, PACKET_LEN, READ_BUDGET};

/// Per-connection behaviour derived from the server configuration
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Dump raw payloads to diagnostics
    pub debug: bool,
    pub header_policy: HeaderPolicy,
    /// Record successful runs as well as crashes
    pub log_successes: bool,
    /// Deadline for the peer to deliver a full packet
    pub read_timeout: Duration,
}

impl HandlerOptions {
    pub fn from_config(config: &Config) -> Self {
        HandlerOptions {
            debug: config.debug,
            header_policy: config.header_policy,
            log_successes: config.verbose_success_logging,
            read_timeout: config.read_timeout,
        }
    }
}

impl Default for HandlerOptions {
    fn default() -> Self {
        HandlerOptions {
            debug: false,
            header_policy: HeaderPolicy::Lenient,
            log_successes: true,
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// Failure while reading or decoding a connection's packet
#[derive(Debug)]
pub enum ConnectionError {
    Malformed(DecodeError),
    Io(std::io::Error),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Malformed(e) => write!(f, "{}", e),
            ConnectionError::Io(e) => write!(f, "Connection fault: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Malformed(e) => Some(e),
            ConnectionError::Io(e) => Some(e),
        }
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Malformed(e)
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

/// Handle one accepted connection to completion.
///
/// Never fails: errors are reported to diagnostics and the connection
/// is closed regardless.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    log: &LogSink,
    opts: &HandlerOptions,
) {
    if let Err(e) = process(&mut stream, peer, log, opts).await {
        warn!(peer = %peer, error = %e, "Discarding connection");
    }

    close(stream, peer);
}

/// Shut the connection down in both directions and release it
pub fn close(stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = SockRef::from(&stream).shutdown(Shutdown::Both) {
        // Peer may already have reset the connection
        debug!(peer = %peer, error = %e, "Socket shutdown failed");
    }
    drop(stream);
    trace!(peer = %peer, "Connection closed");
}

/// Read, decode and report a single packet
pub async fn process<R>(
    reader: &mut R,
    peer: SocketAddr,
    log: &LogSink,
    opts: &HandlerOptions,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let data = read_packet(reader, opts.read_timeout).await?;

    if opts.debug {
        debug!(peer = %peer, len = data.len(), payload = ?&data[..], "Received payload");
    }

    let result = packet::decode(&data)?;
    report(&result, log, opts);
    Ok(())
}

/// Read until a full packet, EOF, or the deadline, whichever is first.
///
/// At most `READ_BUDGET` bytes are read. A deadline returns whatever
/// arrived so far, leaving the length check to the decoder.
pub async fn read_packet<R>(reader: &mut R, deadline: Duration) -> std::io::Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(READ_BUDGET);

    let read_loop = async {
        while buffer.len() < PACKET_LEN {
            let n = reader.read_buf(&mut buffer).await?;
            if n == 0 {
                trace!(received = buffer.len(), "Peer closed before full packet");
                break;
            }
        }
        Ok::<_, std::io::Error>(())
    };

    let outcome = timeout(deadline, read_loop).await;
    match outcome {
        Ok(result) => result?,
        Err(_) => debug!(received = buffer.len(), "Read deadline elapsed"),
    }

    buffer.truncate(READ_BUDGET);
    Ok(buffer)
}

/// Write the result log entries for a decoded packet
pub fn report(result: &TestResult, log: &LogSink, opts: &HandlerOptions) {
    if !result.header_valid {
        log.warn("Invalid header!");
        if opts.header_policy == HeaderPolicy::Strict {
            return;
        }
    }

    if result.is_success() {
        if opts.log_successes {
            log.success(result.to_string());
        }
    } else {
        log.error(result.to_string());
    }
}
