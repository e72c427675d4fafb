//! This module contains all the capture logic
//!
//! The sender streams raw little-endian f32 samples. Over TCP we read exactly
//! one frame's worth of bytes per cycle, over UDP each datagram is one frame
//! (a short datagram leaves the tail of the frame zeroed).
//!
//! Any read failure drops the connection, so the next read reconnects (and
//! resynchronizes the TCP framing) instead of reading from the middle of a frame.

use std::{
    fmt,
    io::{self, Read},
    net::{SocketAddr, TcpStream, UdpSocket},
    str::FromStr,
    time::Duration,
};

use byte_slice_cast::AsMutByteSlice;
use thiserror::Error;
use tracing::{debug, info};

/// Anything that can hand the orchestrator one frame of samples per cycle
pub trait SampleSource: Send {
    /// Fill all of `buf` with the next frame
    fn read_frame(&mut self, buf: &mut [f32]) -> Result<(), SourceError>;
    /// Human readable description for logs
    fn describe(&self) -> String;
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
    #[error("Timed out waiting for samples from {0}")]
    Timeout(SocketAddr),
    #[error("Read from {addr} failed: {source}")]
    Read { addr: SocketAddr, source: io::Error },
    #[error("Empty datagram from {0}")]
    Empty(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(format!("Unknown protocol `{}`, expected tcp or udp", s)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// Samples from a TCP peer we connect to, or UDP datagrams we listen for on `addr`
pub struct NetworkSource {
    addr: SocketAddr,
    protocol: Protocol,
    read_timeout: Duration,
    conn: Option<Connection>,
}

impl NetworkSource {
    pub fn new(addr: SocketAddr, protocol: Protocol, read_timeout: Duration) -> Self {
        Self {
            addr,
            protocol,
            read_timeout,
            conn: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Open the socket. For TCP this connects to the peer, for UDP it binds `addr`.
    pub fn connect(&mut self) -> Result<(), SourceError> {
        self.conn = Some(self.open()?);
        Ok(())
    }

    fn open(&self) -> Result<Connection, SourceError> {
        let addr = self.addr;
        let wrap = |source| SourceError::Connect { addr, source };
        match self.protocol {
            Protocol::Tcp => {
                let stream = TcpStream::connect_timeout(&addr, self.read_timeout).map_err(wrap)?;
                stream
                    .set_read_timeout(Some(self.read_timeout))
                    .map_err(wrap)?;
                info!(%addr, "Connected to TCP sample source");
                Ok(Connection::Tcp(stream))
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(addr).map_err(wrap)?;
                socket
                    .set_read_timeout(Some(self.read_timeout))
                    .map_err(wrap)?;
                info!(%addr, "Listening for UDP samples");
                Ok(Connection::Udp(socket))
            }
        }
    }

    /// The local end of the socket, once connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.conn.as_ref()? {
            Connection::Tcp(stream) => stream.local_addr().ok(),
            Connection::Udp(socket) => socket.local_addr().ok(),
        }
    }
}

fn read_into(conn: &mut Connection, addr: SocketAddr, buf: &mut [f32]) -> Result<(), SourceError> {
    let read_err = |source: io::Error| match source.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => SourceError::Timeout(addr),
        _ => SourceError::Read { addr, source },
    };
    match conn {
        Connection::Tcp(stream) => stream
            .read_exact(buf.as_mut_byte_slice())
            .map_err(read_err),
        Connection::Udp(socket) => {
            let n = socket.recv(buf.as_mut_byte_slice()).map_err(read_err)?;
            if n == 0 {
                return Err(SourceError::Empty(addr));
            }
            let whole = n / std::mem::size_of::<f32>();
            if whole < buf.len() {
                debug!(samples = whole, "Short datagram, zero filling");
                buf[whole..].fill(0.0);
            }
            Ok(())
        }
    }
}

impl SampleSource for NetworkSource {
    fn read_frame(&mut self, buf: &mut [f32]) -> Result<(), SourceError> {
        // Taken out for the read, a failed read leaves us disconnected
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.open()?,
        };
        read_into(&mut conn, self.addr, buf)?;
        self.conn = Some(conn);
        samples_from_le(buf);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}://{}", self.protocol, self.addr)
    }
}

/// The wire format is little-endian, fix up the words in place (a no-op on LE hosts)
fn samples_from_le(buf: &mut [f32]) {
    buf.iter_mut()
        .for_each(|s| *s = f32::from_bits(u32::from_le(s.to_bits())));
}
