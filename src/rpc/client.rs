use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{RpcError, StatusReport};
use crate::queue::{Frame, FrameBuf, read_frame, write_frame};

/// Foreman-side heartbeat client. Holds one connection per worker and
/// reconnects lazily after any fault; every transport problem surfaces as
/// "no status available" rather than an error.
pub struct StatusClient {
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
    inbuf: FrameBuf,
}

impl StatusClient {
    pub fn connect(port: u16, timeout: Duration) -> Result<Self, RpcError> {
        let stream = open_stream(port, timeout)?;
        Ok(Self {
            port,
            timeout,
            stream: Some(stream),
            inbuf: FrameBuf::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sends the single no-argument status request and waits for one reply
    /// within the configured timeout. The connection is dropped on timeout
    /// as well as on errors so request and reply stay paired one to one.
    pub fn query(&mut self) -> Option<StatusReport> {
        if self.stream.is_none() {
            match open_stream(self.port, self.timeout) {
                Ok(stream) => {
                    self.inbuf = FrameBuf::new();
                    self.stream = Some(stream);
                }
                Err(err) => {
                    debug!("status reconnect to port {} failed: {err}", self.port);
                    return None;
                }
            }
        }
        let stream = self.stream.as_mut()?;
        if let Err(err) = write_frame(stream, &Frame::Request) {
            debug!("status request failed: {err}");
            self.stream = None;
            return None;
        }

        let deadline = Instant::now() + self.timeout;
        let stop = || false;
        loop {
            match read_frame(stream, &mut self.inbuf, Some(deadline), &stop) {
                Ok(Some(Frame::Item { payload })) => match serde_json::from_value(payload) {
                    Ok(report) => return Some(report),
                    Err(err) => {
                        warn!("malformed status report: {err}");
                        self.stream = None;
                        return None;
                    }
                },
                Ok(Some(other)) => {
                    warn!("unexpected status frame: {other:?}");
                }
                Ok(None) => {
                    debug!("status request to port {} timed out", self.port);
                    self.stream = None;
                    return None;
                }
                Err(err) => {
                    debug!("status receive failed: {err}");
                    self.stream = None;
                    return None;
                }
            }
        }
    }
}

fn open_stream(port: u16, timeout: Duration) -> Result<TcpStream, RpcError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

impl std::fmt::Debug for StatusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusClient")
            .field("port", &self.port)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}
