use std::collections::VecDeque;
use std::io::Read;
use std::marker::PhantomData;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::frame::{self, Frame, FrameBuf};
use super::push::connect_with_retries;
use super::{ItemConsumer, ItemProducer, Lifecycle, Popped, Queue, QueueConfig, QueueError};

const RESPONDER_TICK: Duration = Duration::from_millis(10);
const REQUEST_RETRY_SLICE: Duration = Duration::from_millis(100);

/// Reply binder with an in-process buffer. A dedicated responder thread
/// owns the socket exclusively and answers waiting requesters from the
/// buffer, so the producer never blocks on network I/O. The bounded
/// crossbeam channel is the only structure shared between the two.
pub struct BufferedReplyBindQueue<T> {
    cfg: QueueConfig,
    lifecycle: Lifecycle,
    port: Option<u16>,
    tx: Option<Sender<Frame>>,
    rx: Option<Receiver<Frame>>,
    responder: Option<JoinHandle<()>>,
    closed: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BufferedReplyBindQueue<T> {
    pub fn new(cfg: QueueConfig) -> Self {
        let (tx, rx) = bounded(cfg.buffer_size.max(1));
        Self {
            cfg,
            lifecycle: Lifecycle::Created,
            port: None,
            tx: Some(tx),
            rx: Some(rx),
            responder: None,
            closed: Arc::new(AtomicBool::new(false)),
            aborted: Arc::new(AtomicBool::new(false)),
            _marker: PhantomData,
        }
    }

    fn sender(&self) -> Result<&Sender<Frame>, QueueError> {
        match self.lifecycle {
            Lifecycle::Created => Err(QueueError::NotStarted),
            Lifecycle::Closed => Err(QueueError::Closed),
            Lifecycle::Open => self.tx.as_ref().ok_or(QueueError::Closed),
        }
    }
}

impl<T> Queue for BufferedReplyBindQueue<T> {
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

        let rx = self.rx.take().ok_or(QueueError::AlreadyStarted)?;
        let name = self.cfg.name.clone();
        let timeout = self.cfg.timeout();
        let linger = self.cfg.linger();
        let closed = self.closed.clone();
        let aborted = self.aborted.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{name}-responder"))
            .spawn(move || {
                responder_loop(name, listener, rx, timeout, linger, closed, aborted);
            })
            .map_err(QueueError::Io)?;
        self.responder = Some(handle);
        self.lifecycle = Lifecycle::Open;
        Ok(())
    }

    fn close(&mut self, abort: bool) -> Result<(), QueueError> {
        if abort {
            self.aborted.store(true, Ordering::Relaxed);
            self.closed.store(true, Ordering::Relaxed);
            self.tx = None;
            if let Some(handle) = self.responder.take() {
                let _ = handle.join();
            }
            self.lifecycle = Lifecycle::Closed;
            return Ok(());
        }
        match self.lifecycle {
            Lifecycle::Closed => return Err(QueueError::AlreadyClosed),
            Lifecycle::Created => {
                self.lifecycle = Lifecycle::Closed;
                return Ok(());
            }
            Lifecycle::Open => {}
        }
        self.closed.store(true, Ordering::Relaxed);
        // Dropping the sender lets the responder observe a drained buffer
        // and finish inside the linger window.
        self.tx = None;
        if let Some(handle) = self.responder.take() {
            let deadline = Instant::now() + self.cfg.linger() + Duration::from_secs(1);
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if !handle.is_finished() {
                self.aborted.store(true, Ordering::Relaxed);
            }
            let _ = handle.join();
        }
        self.lifecycle = Lifecycle::Closed;
        Ok(())
    }
}

impl<T: Serialize> ItemProducer<T> for BufferedReplyBindQueue<T> {
    fn push_item(&self, item: &T) -> Result<(), QueueError> {
        let frame = Frame::Item {
            payload: serde_json::to_value(item)?,
        };
        let tx = self.sender()?;
        match tx.send_timeout(frame, self.cfg.timeout()) {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::SendTimeoutError::Timeout(_)) => Err(QueueError::Full),
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => Err(QueueError::Closed),
        }
    }

    fn try_push_item(&self, item: &T) -> Result<bool, QueueError> {
        let frame = Frame::Item {
            payload: serde_json::to_value(item)?,
        };
        let tx = self.sender()?;
        match tx.try_send(frame) {
            Ok(()) => Ok(true),
            Err(crossbeam_channel::TrySendError::Full(_)) => Ok(false),
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => Err(QueueError::Closed),
        }
    }

    fn push_abort(&self) -> Result<bool, QueueError> {
        let tx = self.sender()?;
        match tx.try_send(Frame::Abort) {
            Ok(()) => Ok(true),
            Err(crossbeam_channel::TrySendError::Full(_)) => Ok(false),
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => Err(QueueError::Closed),
        }
    }
}

struct ResponderConn {
    id: u64,
    stream: TcpStream,
    inbuf: FrameBuf,
    dead: bool,
}

fn responder_loop(
    name: String,
    listener: TcpListener,
    rx: Receiver<Frame>,
    timeout: Duration,
    linger: Duration,
    closed: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
) {
    let mut conns: Vec<ResponderConn> = Vec::new();
    let mut waiting: VecDeque<u64> = VecDeque::new();
    let mut next_id: u64 = 0;
    let mut carry: Option<Frame> = None;
    let mut close_deadline: Option<Instant> = None;
    let mut chunk = [0u8; 8192];

    loop {
        if aborted.load(Ordering::Relaxed) {
            break;
        }
        if closed.load(Ordering::Relaxed) && close_deadline.is_none() {
            close_deadline = Some(Instant::now() + linger);
        }
        if let Some(deadline) = close_deadline {
            if Instant::now() >= deadline {
                debug!("queue {name} responder linger expired");
                break;
            }
        }

        // Accept pending requesters.
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    let _ = stream.set_nonblocking(true);
                    let _ = stream.set_nodelay(true);
                    debug!("queue {name} accepted requester {addr}");
                    conns.push(ResponderConn {
                        id: next_id,
                        stream,
                        inbuf: FrameBuf::new(),
                        dead: false,
                    });
                    next_id += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("queue {name} accept failed: {err}");
                    break;
                }
            }
        }

        // Read request frames.
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
                    Err(err) => {
                        warn!("queue {name} requester read error: {err}");
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
                    Ok(Some(Frame::Request)) => waiting.push_back(conn.id),
                    Ok(Some(other)) => {
                        warn!("queue {name} unexpected frame from requester: {other:?}");
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("queue {name} requester frame error: {err}");
                        conn.dead = true;
                        break;
                    }
                }
            }
        }
        conns.retain(|c| !c.dead);
        waiting.retain(|id| conns.iter().any(|c| c.id == *id));

        // Serve one buffered frame per waiting requester.
        let mut buffer_finished = false;
        while !waiting.is_empty() {
            let frame = match carry.take() {
                Some(frame) => frame,
                None => match rx.try_recv() {
                    Ok(frame) => frame,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        buffer_finished = true;
                        break;
                    }
                },
            };
            let conn_id = match waiting.pop_front() {
                Some(id) => id,
                None => {
                    carry = Some(frame);
                    break;
                }
            };
            let conn = conns.iter_mut().find(|c| c.id == conn_id);
            match conn {
                Some(conn) => {
                    if let Err(err) = send_reply(&mut conn.stream, &frame, timeout) {
                        warn!("queue {name} reply send failed: {err}");
                        conn.dead = true;
                        // Keep the item for the next requester.
                        carry = Some(frame);
                    }
                }
                None => carry = Some(frame),
            }
            conns.retain(|c| !c.dead);
        }

        if buffer_finished && carry.is_none() {
            debug!("queue {name} responder buffer drained");
            break;
        }

        std::thread::sleep(RESPONDER_TICK);
    }
    // Dropping the listener and connections here gives pending requesters
    // an EOF, which they surface as a closed queue.
}

fn send_reply(stream: &mut TcpStream, frame: &Frame, timeout: Duration) -> Result<(), QueueError> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(timeout))?;
    let result = frame::write_frame(stream, frame);
    let _ = stream.set_nonblocking(true);
    result
}

/// Requester half of task dispatch: sends an empty request and blocks for
/// exactly one reply, so a worker can only ever hold one outstanding item.
pub struct RequestConnectQueue<T> {
    cfg: QueueConfig,
    peer_port: u16,
    lifecycle: Lifecycle,
    stream: Option<TcpStream>,
    inbuf: FrameBuf,
    abort_flag: Option<Arc<AtomicBool>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RequestConnectQueue<T> {
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
    /// can interrupt the reply wait.
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort_flag = Some(flag);
        self
    }

    fn stopped(&self) -> bool {
        self.abort_flag
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn send_request(&mut self) -> Result<(), QueueError> {
        let deadline = Instant::now() + self.cfg.timeout();
        loop {
            if self.stopped() {
                return Err(QueueError::Closed);
            }
            if self.stream.is_none() {
                match connect_with_retries(&self.cfg.name, self.peer_port, deadline) {
                    Ok(stream) => {
                        self.inbuf = FrameBuf::new();
                        self.stream = Some(stream);
                    }
                    Err(err) => {
                        debug!("queue {} request connect failed: {err}", self.cfg.name);
                        return Err(QueueError::Empty);
                    }
                }
            }
            let stream = self.stream.as_mut().ok_or(QueueError::NotStarted)?;
            match frame::write_frame(stream, &Frame::Request) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!("queue {} request send failed: {err}", self.cfg.name);
                    self.stream = None;
                    if Instant::now() >= deadline {
                        return Err(QueueError::Empty);
                    }
                    std::thread::sleep(REQUEST_RETRY_SLICE);
                }
            }
        }
    }
}

impl<T> Queue for RequestConnectQueue<T> {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn port(&self) -> Option<u16> {
        Some(self.peer_port)
    }

    fn open(&mut self) -> Result<(), QueueError> {
        match self.lifecycle {
            Lifecycle::Open => Err(QueueError::AlreadyStarted),
            Lifecycle::Closed => Err(QueueError::AlreadyClosed),
            Lifecycle::Created => {
                // Connection is established lazily on the first pop so a
                // worker can construct its queue before the binder is up.
                self.lifecycle = Lifecycle::Open;
                Ok(())
            }
        }
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

impl<T: DeserializeOwned> ItemConsumer<T> for RequestConnectQueue<T> {
    fn pop_item(&mut self) -> Result<Popped<T>, QueueError> {
        match self.lifecycle {
            Lifecycle::Created => return Err(QueueError::NotStarted),
            Lifecycle::Closed => return Err(QueueError::Closed),
            Lifecycle::Open => {}
        }
        // Failure to even deliver the request within the timeout means the
        // binder is unreachable; the caller sees an empty queue.
        self.send_request()?;

        // Once the request is delivered the reply can take as long as the
        // binder needs; only peer close or a local abort ends the wait.
        let abort = self.abort_flag.clone();
        let stop = move || {
            abort
                .as_ref()
                .map(|f| f.load(Ordering::Relaxed))
                .unwrap_or(false)
        };
        let stream = self.stream.as_mut().ok_or(QueueError::NotStarted)?;
        loop {
            match frame::read_frame(stream, &mut self.inbuf, None, &stop) {
                Ok(Some(Frame::Item { payload })) => {
                    return Ok(Popped::Item(serde_json::from_value(payload)?));
                }
                Ok(Some(Frame::Abort)) => return Ok(Popped::Abort),
                Ok(Some(Frame::Request)) => {
                    warn!(
                        "queue {} ignoring request frame on requester side",
                        self.cfg.name
                    );
                }
                Ok(None) => continue,
                Err(QueueError::Closed) => {
                    self.stream = None;
                    return Err(QueueError::Closed);
                }
                Err(err) => {
                    // The reply may be lost; surface a timeout rather than
                    // re-requesting and risking a duplicate item.
                    warn!("queue {} reply receive error: {err}", self.cfg.name);
                    self.stream = None;
                    return Err(QueueError::Empty);
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for BufferedReplyBindQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedReplyBindQueue")
            .field("name", &self.cfg.name)
            .field("port", &self.port)
            .finish()
    }
}

impl<T> std::fmt::Debug for RequestConnectQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestConnectQueue")
            .field("name", &self.cfg.name)
            .field("peer_port", &self.peer_port)
            .finish()
    }
}
