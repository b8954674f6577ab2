use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::QueueError;

/// Upper bound on a single frame body. Anything larger is a codec error,
/// not a transfer.
pub const FRAME_LIMIT_BYTES: usize = 64 * 1024 * 1024;

const POLL_SLICE: Duration = Duration::from_millis(100);

/// Wire unit: a 4-byte big-endian length prefix followed by a JSON body.
/// The abort sentinel is a distinct variant so it can never be confused
/// with a payload, and `Request` is the empty "give me work" message of
/// the request/reply patterns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Item { payload: serde_json::Value },
    Abort,
    Request,
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, QueueError> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > FRAME_LIMIT_BYTES {
        return Err(QueueError::Oversize(body.len()));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Incremental frame decoder. Sockets are read in arbitrary slices; bytes
/// are fed in as they arrive and complete frames drained out.
#[derive(Debug, Default)]
pub struct FrameBuf {
    buf: Vec<u8>,
}

impl FrameBuf {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, QueueError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > FRAME_LIMIT_BYTES {
            return Err(QueueError::Oversize(len));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let frame = serde_json::from_slice(&self.buf[4..4 + len])?;
        self.buf.drain(..4 + len);
        Ok(Some(frame))
    }
}

pub(crate) fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<(), QueueError> {
    let bytes = encode_frame(frame)?;
    stream.write_all(&bytes)?;
    Ok(())
}

/// Read from `stream` until one full frame is decoded. `Ok(None)` means the
/// deadline passed with no complete frame; `Closed` means the peer hung up
/// or `stop` asked us to give up.
pub(crate) fn read_frame(
    stream: &mut TcpStream,
    inbuf: &mut FrameBuf,
    deadline: Option<Instant>,
    stop: &dyn Fn() -> bool,
) -> Result<Option<Frame>, QueueError> {
    if let Some(frame) = inbuf.next_frame()? {
        return Ok(Some(frame));
    }
    let mut chunk = [0u8; 4096];
    loop {
        if stop() {
            return Err(QueueError::Closed);
        }
        if let Some(d) = deadline {
            if Instant::now() >= d {
                return Ok(None);
            }
        }
        stream.set_read_timeout(Some(POLL_SLICE))?;
        match stream.read(&mut chunk) {
            Ok(0) => return Err(QueueError::Closed),
            Ok(n) => {
                inbuf.extend(&chunk[..n]);
                if let Some(frame) = inbuf.next_frame()? {
                    return Ok(Some(frame));
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(QueueError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FRAME_LIMIT_BYTES, Frame, FrameBuf, encode_frame};
    use crate::queue::QueueError;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::Item {
            payload: serde_json::json!({"path": "/evidence/a", "kind": "file"}),
        };
        let bytes = encode_frame(&frame).expect("encode");
        let mut buf = FrameBuf::new();
        buf.extend(&bytes);
        let decoded = buf.next_frame().expect("decode").expect("frame");
        assert_eq!(decoded, frame);
        assert!(buf.next_frame().expect("empty").is_none());
    }

    #[test]
    fn partial_feed_decodes_once_complete() {
        let bytes = encode_frame(&Frame::Abort).expect("encode");
        let mut buf = FrameBuf::new();
        for byte in &bytes[..bytes.len() - 1] {
            buf.extend(std::slice::from_ref(byte));
            assert!(buf.next_frame().expect("partial").is_none());
        }
        buf.extend(&bytes[bytes.len() - 1..]);
        assert_eq!(buf.next_frame().expect("decode"), Some(Frame::Abort));
    }

    #[test]
    fn two_frames_in_one_feed() {
        let mut bytes = encode_frame(&Frame::Request).expect("encode");
        bytes.extend(encode_frame(&Frame::Abort).expect("encode"));
        let mut buf = FrameBuf::new();
        buf.extend(&bytes);
        assert_eq!(buf.next_frame().expect("first"), Some(Frame::Request));
        assert_eq!(buf.next_frame().expect("second"), Some(Frame::Abort));
        assert!(buf.next_frame().expect("drained").is_none());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = FrameBuf::new();
        let len = (FRAME_LIMIT_BYTES as u32 + 1).to_be_bytes();
        buf.extend(&len);
        match buf.next_frame() {
            Err(QueueError::Oversize(_)) => {}
            other => panic!("expected oversize error, got {other:?}"),
        }
    }

    #[test]
    fn abort_sentinel_is_not_an_item() {
        let bytes = encode_frame(&Frame::Abort).expect("encode");
        let mut buf = FrameBuf::new();
        buf.extend(&bytes);
        match buf.next_frame().expect("decode").expect("frame") {
            Frame::Item { .. } => panic!("abort decoded as item"),
            Frame::Abort => {}
            Frame::Request => panic!("abort decoded as request"),
        }
    }
}
