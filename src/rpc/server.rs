use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use super::{RpcError, StatusSource};
use crate::queue::{Frame, FrameBuf, write_frame};
use crate::util;

const PORT_BASE: u16 = 49152;
const PORT_SPAN: u32 = 16384;
const PORT_ATTEMPTS: usize = 32;
const SERVE_TICK: Duration = Duration::from_millis(50);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// In-worker status server. Owns a background thread that answers heartbeat
/// requests with a snapshot from the [`StatusSource`], and publishes its
/// port through a file the parent polls for.
pub struct StatusServer {
    port: u16,
    pid: u32,
    rpc_dir: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StatusServer {
    /// Binds a port derived from the process id, publishes the port file
    /// and starts serving. `mute` keeps the listener accepting but never
    /// answering, which drives the parent's consecutive-failure counter.
    pub fn start(
        rpc_dir: &Path,
        source: Arc<dyn StatusSource>,
        mute: bool,
    ) -> Result<Self, RpcError> {
        let pid = std::process::id();
        let listener = bind_status_listener(pid)?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        util::write_port_file(rpc_dir, pid, port).map_err(RpcError::PortFile)?;
        debug!("status server listening on port {port} for pid {pid}");

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("status-server".to_string())
            .spawn(move || serve_loop(listener, source, mute, thread_stop))?;

        Ok(Self {
            port,
            pid,
            rpc_dir: rpc_dir.to_path_buf(),
            stop,
            handle: Some(handle),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        util::remove_port_file(&self.rpc_dir, self.pid);
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

/// Preferred port comes from the process id; collisions fall back to a
/// bounded scan of clock-derived candidates in the dynamic range.
fn bind_status_listener(pid: u32) -> Result<TcpListener, RpcError> {
    let preferred = PORT_BASE + (pid % PORT_SPAN) as u16;
    if let Ok(listener) = TcpListener::bind(("127.0.0.1", preferred)) {
        return Ok(listener);
    }
    for attempt in 0..PORT_ATTEMPTS {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let mixed = nanos.wrapping_add(attempt as u32 * 7919);
        let candidate = PORT_BASE + (mixed % PORT_SPAN) as u16;
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", candidate)) {
            return Ok(listener);
        }
    }
    Err(RpcError::NoPort)
}

struct ServerConn {
    stream: TcpStream,
    inbuf: FrameBuf,
    dead: bool,
}

fn serve_loop(
    listener: TcpListener,
    source: Arc<dyn StatusSource>,
    mute: bool,
    stop: Arc<AtomicBool>,
) {
    let mut conns: Vec<ServerConn> = Vec::new();
    let mut chunk = [0u8; 4096];

    while !stop.load(Ordering::Relaxed) {
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    let _ = stream.set_nonblocking(true);
                    let _ = stream.set_nodelay(true);
                    conns.push(ServerConn {
                        stream,
                        inbuf: FrameBuf::new(),
                        dead: false,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("status server accept failed: {err}");
                    break;
                }
            }
        }

        for conn in conns.iter_mut() {
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        conn.dead = true;
                        break;
                    }
                    Ok(n) => conn.inbuf.extend(&chunk[..n]),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(_) => {
                        conn.dead = true;
                        break;
                    }
                }
            }
            if conn.dead {
                continue;
            }
            loop {
                match conn.inbuf.next_frame() {
                    Ok(Some(Frame::Request)) => {
                        if mute {
                            continue;
                        }
                        if let Err(err) = answer(&mut conn.stream, source.as_ref()) {
                            debug!("status reply failed: {err}");
                            conn.dead = true;
                            break;
                        }
                    }
                    Ok(Some(other)) => {
                        warn!("status server ignoring frame: {other:?}");
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("status server frame error: {err}");
                        conn.dead = true;
                        break;
                    }
                }
            }
        }
        conns.retain(|c| !c.dead);

        std::thread::sleep(SERVE_TICK);
    }
}

fn answer(stream: &mut TcpStream, source: &dyn StatusSource) -> Result<(), RpcError> {
    let report = source.status_report();
    let frame = Frame::Item {
        payload: serde_json::to_value(&report)?,
    };
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(REPLY_TIMEOUT))?;
    let result = write_frame(stream, &frame);
    let _ = stream.set_nonblocking(true);
    result.map_err(|err| match err {
        crate::queue::QueueError::Io(io) => RpcError::Io(io),
        other => RpcError::Io(std::io::Error::other(other.to_string())),
    })
}
