//! TCP transport.

use super::{Connected, Link, Transport};
use crate::error::{LinkError, Result};
use crate::types::Endpoint;
use crate::wire::{read_frame, write_frame, Frame};
use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Connects with `TcpStream::connect_timeout` and decodes inbound frames on a
/// dedicated reader thread.
#[derive(Clone, Debug)]
pub struct TcpTransport {
    nodelay: bool,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Toggle `TCP_NODELAY` on new connections (default: on).
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Connected> {
        let addrs = endpoint
            .address()
            .to_socket_addrs()
            .map_err(|e| LinkError::Connect {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(self.nodelay)?;
                    return spawn_link(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(LinkError::Connect {
            endpoint: endpoint.clone(),
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses resolved".to_string()),
        })
    }
}

/// Outbound half of a TCP connection.
pub struct TcpLink {
    writer: Mutex<BufWriter<TcpStream>>,
    control: TcpStream,
}

impl Link for TcpLink {
    fn send(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock();
        write_frame(&mut *writer, frame)
    }

    fn close(&self) {
        // Unblocks the reader thread, which then disconnects the inbound channel.
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

/// Wrap an established stream (client or accepted) into a link plus inbound channel.
pub fn spawn_link(stream: TcpStream) -> Result<Connected> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let read_half = stream.try_clone()?;
    let control = stream.try_clone()?;
    let (tx, rx) = unbounded();

    thread::Builder::new()
        .name(format!("heaplink-tcp-{}", peer))
        .spawn(move || {
            let mut reader = BufReader::new(read_half);
            loop {
                match read_frame(&mut reader) {
                    Ok(Some(frame)) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(peer = %peer, "Connection closed by peer");
                        break;
                    }
                    Err(LinkError::Io(e)) => {
                        debug!(peer = %peer, error = %e, "Connection read ended");
                        break;
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Dropping connection after bad frame");
                        break;
                    }
                }
            }
        })?;

    Ok(Connected {
        link: Box::new(TcpLink {
            writer: Mutex::new(BufWriter::new(stream)),
            control,
        }),
        inbound: rx,
    })
}
