//! Duplex channels carrying framed messages
//!
//! Session logic on both sides only talks to [`Channel`]. Two realizations
//! are provided: [`BufferChannel`] for in-memory request/response pairing
//! (build a request now, feed the response later) and [`NetworkChannel`]
//! over TCP.

use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::net::TcpStream;

use crate::error::{Error, OperationKind};
use crate::he::CryptoContext;
use crate::wire::{self, FrameHeader, Message, MessageKind, Request, Response, ResultPart, HEADER_SIZE};
use crate::Result;

pub trait Channel {
    /// Encode and write one message
    fn send(&mut self, message: &Message) -> Result<()>;

    /// Read one frame, returning its validated header and raw body
    fn receive_frame(&mut self) -> Result<(FrameHeader, Vec<u8>)>;

    fn bytes_sent(&self) -> u64;

    fn bytes_received(&self) -> u64;

    /// Receive a request, optionally requiring a particular operation
    fn receive_operation(
        &mut self,
        context: Option<&CryptoContext>,
        expected: Option<OperationKind>,
    ) -> Result<Request> {
        let (header, body) = self.receive_frame()?;
        let received = header.kind.operation().ok_or_else(|| {
            Error::MalformedMessage(format!("expected a request, got {}", header.kind))
        })?;
        if let Some(expected) = expected {
            if expected != received {
                return Err(Error::InvalidOperationKind { expected, received });
            }
        }
        Request::try_from(wire::decode_body(header.kind, &body, context)?)
    }

    /// Receive a params, OPRF or query response
    ///
    /// Query responses carry a context id that is checked later by the
    /// caller against its own context.
    fn receive_response(&mut self) -> Result<Response> {
        let (header, body) = self.receive_frame()?;
        let message = match header.kind {
            MessageKind::QueryResponse => {
                let response: wire::QueryResponse = bincode::deserialize(&body).map_err(|e| {
                    Error::MalformedMessage(format!("failed to decode {} body: {}", header.kind, e))
                })?;
                Message::QueryResponse(response)
            }
            kind => wire::decode_body(kind, &body, None)?,
        };
        Response::try_from(message)
    }

    fn receive_result(&mut self, context: &CryptoContext) -> Result<ResultPart> {
        let (header, body) = self.receive_frame()?;
        if header.kind != MessageKind::ResultPart {
            return Err(Error::MalformedMessage(format!(
                "expected {}, got {}",
                MessageKind::ResultPart,
                header.kind
            )));
        }
        match wire::decode_body(header.kind, &body, Some(context))? {
            Message::ResultPart(part) => Ok(part),
            other => Err(Error::MalformedMessage(format!(
                "expected {}, got {}",
                MessageKind::ResultPart,
                other.kind()
            ))),
        }
    }
}

/// Framing over any reader/writer pair
pub struct StreamChannel<R, W> {
    reader: R,
    writer: W,
    bytes_sent: u64,
    bytes_received: u64,
    io_error: fn(std::io::Error) -> Error,
}

impl<R: Read, W: Write> StreamChannel<R, W> {
    /// `io_error` decides how an I/O failure surfaces to the caller
    pub fn new(reader: R, writer: W, io_error: fn(std::io::Error) -> Error) -> Self {
        Self {
            reader,
            writer,
            bytes_sent: 0,
            bytes_received: 0,
            io_error,
        }
    }

    pub fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn send(&mut self, message: &Message) -> Result<()> {
        let frame = wire::encode(message)?;
        self.writer.write_all(&frame).map_err(self.io_error)?;
        self.writer.flush().map_err(self.io_error)?;
        self.bytes_sent += frame.len() as u64;
        Ok(())
    }

    pub fn receive_frame(&mut self) -> Result<(FrameHeader, Vec<u8>)> {
        let mut head = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut head).map_err(self.io_error)?;
        let header = FrameHeader::from_bytes(&head)?;

        // The declared length is untrusted until the bytes arrive
        let mut body = Vec::new();
        (&mut self.reader)
            .take(header.body_len)
            .read_to_end(&mut body)
            .map_err(self.io_error)?;
        if body.len() as u64 != header.body_len {
            return Err((self.io_error)(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("frame body ended after {} of {} bytes", body.len(), header.body_len),
            )));
        }
        self.bytes_received += (HEADER_SIZE + body.len()) as u64;
        Ok((header, body))
    }
}

fn buffer_io_error(e: std::io::Error) -> Error {
    Error::MalformedMessage(format!("input buffer exhausted: {}", e))
}

fn network_io_error(e: std::io::Error) -> Error {
    Error::TransportError(e.to_string())
}

/// In-memory channel over an input and an output buffer
///
/// Never blocks. Reading past the end of the input is a `MalformedMessage`.
pub struct BufferChannel {
    inner: StreamChannel<Cursor<Vec<u8>>, Cursor<Vec<u8>>>,
}

impl BufferChannel {
    pub fn new() -> Self {
        Self {
            inner: StreamChannel::new(Cursor::new(Vec::new()), Cursor::new(Vec::new()), buffer_io_error),
        }
    }

    /// Replace the input buffer and rewind its read cursor
    pub fn set_input(&mut self, bytes: Vec<u8>) {
        *self.inner.reader_mut() = Cursor::new(bytes);
    }

    /// Return everything written since the last extraction
    ///
    /// The write cursor is rewound to the start; the buffer keeps its
    /// allocation and is overwritten by later sends.
    pub fn extract_output(&mut self) -> Vec<u8> {
        let writer = self.inner.writer_mut();
        let len = writer.position() as usize;
        let out = writer.get_ref()[..len].to_vec();
        writer.set_position(0);
        out
    }
}

impl Default for BufferChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for BufferChannel {
    fn send(&mut self, message: &Message) -> Result<()> {
        self.inner.send(message)
    }

    fn receive_frame(&mut self) -> Result<(FrameHeader, Vec<u8>)> {
        self.inner.receive_frame()
    }

    fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent
    }

    fn bytes_received(&self) -> u64 {
        self.inner.bytes_received
    }
}

type TcpFraming = StreamChannel<BufReader<TcpStream>, BufWriter<TcpStream>>;

/// TCP channel
///
/// Blocks on I/O. Any transport failure surfaces as `TransportError` and
/// leaves the channel disconnected.
#[derive(Default)]
pub struct NetworkChannel {
    inner: Option<TcpFraming>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl NetworkChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an accepted stream
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let mut channel = Self::new();
        channel.attach(stream)?;
        Ok(channel)
    }

    fn attach(&mut self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true).map_err(network_io_error)?;
        let reader = stream.try_clone().map_err(network_io_error)?;
        self.inner = Some(StreamChannel::new(
            BufReader::new(reader),
            BufWriter::new(stream),
            network_io_error,
        ));
        Ok(())
    }

    /// Connect to `tcp://host:port`
    ///
    /// Returns whether the connection was established; failures are logged.
    pub fn connect(&mut self, address: &str) -> bool {
        let Some(target) = address.strip_prefix("tcp://") else {
            tracing::warn!(address, "unsupported endpoint scheme, expected tcp://host:port");
            return false;
        };

        match TcpStream::connect(target).map_err(network_io_error).and_then(|s| self.attach(s)) {
            Ok(()) => {
                tracing::debug!(address, "channel connected");
                true
            }
            Err(e) => {
                tracing::warn!(address, error = %e, "failed to connect");
                self.inner = None;
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_some()
    }

    pub fn disconnect(&mut self) {
        self.inner = None;
    }

    fn with_stream<T>(&mut self, f: impl FnOnce(&mut TcpFraming) -> Result<T>) -> Result<T> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| Error::TransportError("channel is not connected".into()))?;
        let sent = inner.bytes_sent;
        let received = inner.bytes_received;

        let result = f(inner);
        self.bytes_sent += inner.bytes_sent - sent;
        self.bytes_received += inner.bytes_received - received;

        if let Err(Error::TransportError(_)) = &result {
            self.inner = None;
        }
        result
    }
}

impl Channel for NetworkChannel {
    fn send(&mut self, message: &Message) -> Result<()> {
        self.with_stream(|s| s.send(message))
    }

    fn receive_frame(&mut self) -> Result<(FrameHeader, Vec<u8>)> {
        self.with_stream(|s| s.receive_frame())
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}
