use std::io::Read;
use std::marker::PhantomData;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::frame::{self, Frame, FrameBuf};
use super::{ItemConsumer, ItemProducer, Lifecycle, Popped, Queue, QueueConfig, QueueError};

const RETRY_SLICE: Duration = Duration::from_millis(50);
const CONNECT_SLICE: Duration = Duration::from_millis(250);

/// Fire-and-forget binder: accepts any number of pull connectors and
/// rotates pushed items across them.
pub struct PushBindQueue<T> {
    cfg: QueueConfig,
    lifecycle: Lifecycle,
    port: Option<u16>,
    inner: Option<Mutex<PushState>>,
    _marker: PhantomData<fn() -> T>,
}

struct PushState {
    listener: TcpListener,
    peers: Vec<TcpStream>,
    next_peer: usize,
}

impl<T> PushBindQueue<T> {
    pub fn new(cfg: QueueConfig) -> Self {
        Self {
            cfg,
            lifecycle: Lifecycle::Created,
            port: None,
            inner: None,
            _marker: PhantomData,
        }
    }

    /// Number of currently connected consumers, after accepting any
    /// pending connections.
    pub fn peer_count(&self) -> usize {
        match &self.inner {
            Some(inner) => {
                let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
                accept_pending(&mut state, &self.cfg);
                state.peers.len()
            }
            None => 0,
        }
    }

    fn attempt_push(&self, frame: &Frame) -> Result<bool, QueueError> {
        let inner = self.inner.as_ref().ok_or(QueueError::NotStarted)?;
        let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
        accept_pending(&mut state, &self.cfg);
        while !state.peers.is_empty() {
            let idx = state.next_peer % state.peers.len();
            let result = frame::write_frame(&mut state.peers[idx], frame);
            match result {
                Ok(()) => {
                    state.next_peer = state.next_peer.wrapping_add(1);
                    return Ok(true);
                }
                Err(err) => {
                    // Peer is gone; drop it and try the next one.
                    warn!("queue {} dropping peer after send error: {err}", self.cfg.name);
                    state.peers.remove(idx);
                }
            }
        }
        Ok(false)
    }

    fn push_frame_blocking(&self, frame: &Frame) -> Result<(), QueueError> {
        let deadline = Instant::now() + self.cfg.timeout();
        loop {
            if self.attempt_push(frame)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(QueueError::Full);
            }
            std::thread::sleep(RETRY_SLICE);
        }
    }
}

fn accept_pending(state: &mut PushState, cfg: &QueueConfig) {
    loop {
        match state.listener.accept() {
            Ok((stream, addr)) => {
                let _ = stream.set_nodelay(true);
                let _ = stream.set_write_timeout(Some(cfg.timeout()));
                debug!("queue {} accepted consumer {addr}", cfg.name);
                state.peers.push(stream);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(err) => {
                warn!("queue {} accept failed: {err}", cfg.name);
                break;
            }
        }
    }
}

impl<T> Queue for PushBindQueue<T> {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn port(&self) -> Option<u16> {
        self.port
    }

    fn open(&mut self) -> Result<(), QueueError> {
        match self.lifecycle {
            Lifecycle::Open => return Err(QueueError::AlreadyStarted),
            Lifecycle::Closed => return Err(QueueError::AlreadyClosed),
            Lifecycle::Created => {}
        }
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .map_err(|e| QueueError::Bind(format!("{}: {e}", self.cfg.name)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| QueueError::Bind(format!("{}: {e}", self.cfg.name)))?;
        self.port = Some(
            listener
                .local_addr()
                .map_err(|e| QueueError::Bind(format!("{}: {e}", self.cfg.name)))?
                .port(),
        );
        self.inner = Some(Mutex::new(PushState {
            listener,
            peers: Vec::new(),
            next_peer: 0,
        }));
        self.lifecycle = Lifecycle::Open;
        Ok(())
    }

    fn close(&mut self, abort: bool) -> Result<(), QueueError> {
        if abort {
            self.inner = None;
            self.lifecycle = Lifecycle::Closed;
            return Ok(());
        }
        match self.lifecycle {
            Lifecycle::Closed => Err(QueueError::AlreadyClosed),
            _ => {
                // Writes are synchronous, so every pushed frame is already
                // on the wire; the linger window only keeps the sockets up
                // until each consumer has finished reading.
                if let Some(inner) = self.inner.take() {
                    let state = inner.into_inner().unwrap_or_else(|e| e.into_inner());
                    drain_peers(&self.cfg, state.peers);
                }
                self.lifecycle = Lifecycle::Closed;
                Ok(())
            }
        }
    }
}

/// Half-closes each peer socket and holds it until the consumer closes
/// its end or the linger window runs out.
fn drain_peers(cfg: &QueueConfig, peers: Vec<TcpStream>) {
    let deadline = Instant::now() + cfg.linger();
    let mut sink = [0u8; 512];
    for mut peer in peers {
        let _ = peer.shutdown(Shutdown::Write);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("queue {} linger expired with a peer still open", cfg.name);
                break;
            }
            if peer.set_read_timeout(Some(remaining.min(CONNECT_SLICE))).is_err() {
                break;
            }
            match peer.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(_) => break,
            }
        }
    }
}

impl<T: Serialize> ItemProducer<T> for PushBindQueue<T> {
    fn push_item(&self, item: &T) -> Result<(), QueueError> {
        let frame = Frame::Item {
            payload: serde_json::to_value(item)?,
        };
        self.push_frame_blocking(&frame)
    }

    fn try_push_item(&self, item: &T) -> Result<bool, QueueError> {
        let frame = Frame::Item {
            payload: serde_json::to_value(item)?,
        };
        self.attempt_push(&frame)
    }

    fn push_abort(&self) -> Result<bool, QueueError> {
        // Abort fans out to every connected consumer.
        let inner = self.inner.as_ref().ok_or(QueueError::NotStarted)?;
        let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
        accept_pending(&mut state, &self.cfg);
        let mut sent = false;
        state.peers.retain_mut(|peer| {
            match frame::write_frame(peer, &Frame::Abort) {
                Ok(()) => {
                    sent = true;
                    true
                }
                Err(err) => {
                    warn!("queue {} abort send failed: {err}", self.cfg.name);
                    false
                }
            }
        });
        Ok(sent)
    }
}

/// Consumer half of the fan-out pattern: connects to a push binder and
/// pops items.
pub struct PullConnectQueue<T> {
    cfg: QueueConfig,
    peer_port: u16,
    lifecycle: Lifecycle,
    stream: Option<TcpStream>,
    inbuf: FrameBuf,
    abort_flag: Option<Arc<AtomicBool>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PullConnectQueue<T> {
    pub fn new(cfg: QueueConfig, peer_port: u16) -> Self {
        Self {
            cfg,
            peer_port,
            lifecycle: Lifecycle::Created,
            stream: None,
            inbuf: FrameBuf::new(),
            abort_flag: None,
            _marker: PhantomData,
        }
    }

    /// Wire an external abort flag into blocking pops so a signal handler
    /// can interrupt them.
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort_flag = Some(flag);
        self
    }
}

pub(crate) fn connect_with_retries(
    name: &str,
    port: u16,
    deadline: Instant,
) -> Result<TcpStream, QueueError> {
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    loop {
        match TcpStream::connect_timeout(&addr, CONNECT_SLICE) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(QueueError::Bind(format!(
                        "{name}: connect to 127.0.0.1:{port} failed: {err}"
                    )));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

impl<T> Queue for PullConnectQueue<T> {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn port(&self) -> Option<u16> {
        Some(self.peer_port)
    }

    fn open(&mut self) -> Result<(), QueueError> {
        match self.lifecycle {
            Lifecycle::Open => return Err(QueueError::AlreadyStarted),
            Lifecycle::Closed => return Err(QueueError::AlreadyClosed),
            Lifecycle::Created => {}
        }
        let deadline = Instant::now() + self.cfg.timeout();
        let stream = connect_with_retries(&self.cfg.name, self.peer_port, deadline)?;
        self.stream = Some(stream);
        self.lifecycle = Lifecycle::Open;
        Ok(())
    }

    fn close(&mut self, abort: bool) -> Result<(), QueueError> {
        if abort {
            self.stream = None;
            self.lifecycle = Lifecycle::Closed;
            return Ok(());
        }
        match self.lifecycle {
            Lifecycle::Closed => Err(QueueError::AlreadyClosed),
            _ => {
                self.stream = None;
                self.lifecycle = Lifecycle::Closed;
                Ok(())
            }
        }
    }
}

impl<T: DeserializeOwned> ItemConsumer<T> for PullConnectQueue<T> {
    fn pop_item(&mut self) -> Result<Popped<T>, QueueError> {
        match self.lifecycle {
            Lifecycle::Created => return Err(QueueError::NotStarted),
            Lifecycle::Closed => return Err(QueueError::Closed),
            Lifecycle::Open => {}
        }
        let deadline = Instant::now() + self.cfg.timeout();
        let stream = self.stream.as_mut().ok_or(QueueError::NotStarted)?;
        let abort = self.abort_flag.clone();
        let stop = move || {
            abort
                .as_ref()
                .map(|f| f.load(Ordering::Relaxed))
                .unwrap_or(false)
        };
        loop {
            match frame::read_frame(stream, &mut self.inbuf, Some(deadline), &stop) {
                Ok(Some(Frame::Item { payload })) => {
                    return Ok(Popped::Item(serde_json::from_value(payload)?));
                }
                Ok(Some(Frame::Abort)) => return Ok(Popped::Abort),
                Ok(Some(Frame::Request)) => {
                    warn!("queue {} ignoring request frame on pull side", self.cfg.name);
                }
                Ok(None) => return Err(QueueError::Empty),
                Err(QueueError::Closed) => return Err(QueueError::Closed),
                Err(err) => {
                    // Transport trouble is treated as a timeout: nothing
                    // was transferred.
                    warn!("queue {} receive error: {err}", self.cfg.name);
                    return Err(QueueError::Empty);
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for PushBindQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushBindQueue")
            .field("name", &self.cfg.name)
            .field("port", &self.port)
            .finish()
    }
}

impl<T> std::fmt::Debug for PullConnectQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullConnectQueue")
            .field("name", &self.cfg.name)
            .field("peer_port", &self.peer_port)
            .finish()
    }
}
