//! Length-prefixed message framing over the worker's Unix socket.
//!
//! Frames are a `u32` big-endian length followed by the JSON encoding of one
//! protocol enum. Messages from a single sender arrive in send order; a
//! truncated or undecodable frame terminates the channel. The supervisor
//! speaks the async half (`tokio-util` length-delimited codec); the worker
//! process speaks the sync half over `std` I/O, because its dispatcher and
//! worker threads are plain OS threads.
use std::io::{self, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::MedleyResult;
use crate::protocol::{FromWorker, ToWorker};

/// Upper bound on a single frame. Feed documents are the largest payload and
/// stay far below this; anything bigger is a corrupt length prefix.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Wrap the read half of an async channel in the frame codec.
pub fn framed_reader<R: AsyncRead>(reader: R) -> FramedRead<R, LengthDelimitedCodec> {
    FramedRead::new(reader, codec())
}

/// Wrap the write half of an async channel in the frame codec.
pub fn framed_writer<W: AsyncWrite>(writer: W) -> FramedWrite<W, LengthDelimitedCodec> {
    FramedWrite::new(writer, codec())
}

/// Serialize a message for the async framed writer.
pub fn encode<T: Serialize>(msg: &T) -> MedleyResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

/// Deserialize a frame pulled from the async framed reader.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> MedleyResult<T> {
    Ok(serde_json::from_slice(frame)?)
}

/// Write one frame to a blocking stream.
pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame exceeds maximum length",
        ));
    }
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len)?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one frame from a blocking stream. Returns `Ok(None)` on clean EOF at
/// a frame boundary; EOF mid-frame is an error.
pub fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds maximum length",
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Clonable reply publisher shared by the dispatcher thread and all worker
/// threads. The mutex serializes sends so frames never interleave.
#[derive(Clone)]
pub struct ReplySender {
    stream: Arc<Mutex<UnixStream>>,
}

impl ReplySender {
    /// Send one worker-to-main message.
    pub fn send(&self, msg: &FromWorker) -> MedleyResult<()> {
        let payload = serde_json::to_vec(msg)?;
        let mut stream = self.stream.lock().expect("reply stream lock poisoned");
        write_frame(&mut *stream, &payload)?;
        Ok(())
    }
}

/// The worker-process end of the channel: a buffered reader owned by the
/// dispatcher thread plus a shared [`ReplySender`].
pub struct WorkerConnection {
    reader: BufReader<UnixStream>,
    replies: ReplySender,
}

impl WorkerConnection {
    /// Wrap a connected socket.
    pub fn new(stream: UnixStream) -> MedleyResult<Self> {
        let write_half = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            replies: ReplySender {
                stream: Arc::new(Mutex::new(write_half)),
            },
        })
    }

    /// A clonable handle for publishing replies from any thread.
    pub fn reply_sender(&self) -> ReplySender {
        self.replies.clone()
    }

    /// Blocking receive of the next main-to-worker message. `Ok(None)` means
    /// the main process closed the channel.
    pub fn recv(&mut self) -> MedleyResult<Option<ToWorker>> {
        match read_frame(&mut self.reader)? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
            None => Ok(None),
        }
    }
}
