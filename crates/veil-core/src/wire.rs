//! Wire codec
//!
//! Every message is framed as a fixed 16-byte header followed by a bincode
//! body:
//!
//! ```text
//! magic    [u8; 4]  "VPSI"
//! version  u16 LE
//! kind     u16 LE
//! body_len u64 LE
//! ```
//!
//! Messages that carry ciphertexts (query request, query response, result
//! part) can only be decoded against the [`CryptoContext`] they were encoded
//! under.

use serde::{Deserialize, Serialize};

use crate::error::{Error, OperationKind};
use crate::he::{Ciphertext, CryptoContext};
use crate::oprf::OprfPoint;
use crate::Result;

/// Magic bytes opening every frame
pub const FRAME_MAGIC: [u8; 4] = *b"VPSI";

/// Current wire format version
pub const WIRE_VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Upper bound on a declared body length
pub const MAX_BODY_LEN: u64 = 1 << 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    ParamsRequest = 1,
    ParamsResponse = 2,
    OprfRequest = 3,
    OprfResponse = 4,
    QueryRequest = 5,
    QueryResponse = 6,
    ResultPart = 7,
}

impl MessageKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => MessageKind::ParamsRequest,
            2 => MessageKind::ParamsResponse,
            3 => MessageKind::OprfRequest,
            4 => MessageKind::OprfResponse,
            5 => MessageKind::QueryRequest,
            6 => MessageKind::QueryResponse,
            7 => MessageKind::ResultPart,
            _ => return None,
        })
    }

    /// Operation carried by a sender-bound kind
    pub fn operation(self) -> Option<OperationKind> {
        match self {
            MessageKind::ParamsRequest => Some(OperationKind::Params),
            MessageKind::OprfRequest => Some(OperationKind::Oprf),
            MessageKind::QueryRequest => Some(OperationKind::Query),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::ParamsRequest => "ParamsRequest",
            MessageKind::ParamsResponse => "ParamsResponse",
            MessageKind::OprfRequest => "OprfRequest",
            MessageKind::OprfResponse => "OprfResponse",
            MessageKind::QueryRequest => "QueryRequest",
            MessageKind::QueryResponse => "QueryResponse",
            MessageKind::ResultPart => "ResultPart",
        };
        f.write_str(name)
    }
}

/// Fixed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u16,
    pub kind: MessageKind,
    pub body_len: u64,
}

impl FrameHeader {
    pub fn new(kind: MessageKind, body_len: u64) -> Self {
        Self {
            version: WIRE_VERSION,
            kind,
            body_len,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&FRAME_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&(self.kind as u16).to_le_bytes());
        buf[8..16].copy_from_slice(&self.body_len.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::MalformedMessage(format!(
                "frame header needs {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }
        if buf[0..4] != FRAME_MAGIC {
            return Err(Error::MalformedMessage("invalid frame magic".into()));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != WIRE_VERSION {
            return Err(Error::MalformedMessage(format!(
                "unsupported wire version {} (expected {})",
                version, WIRE_VERSION
            )));
        }

        let raw_kind = u16::from_le_bytes([buf[6], buf[7]]);
        let kind = MessageKind::from_u16(raw_kind)
            .ok_or_else(|| Error::MalformedMessage(format!("unknown message kind {}", raw_kind)))?;

        let mut len = [0u8; 8];
        len.copy_from_slice(&buf[8..16]);
        let body_len = u64::from_le_bytes(len);
        if body_len > MAX_BODY_LEN {
            return Err(Error::MalformedMessage(format!(
                "declared body length {} exceeds limit",
                body_len
            )));
        }

        Ok(Self {
            version,
            kind,
            body_len,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamsRequest;

/// Parameters document exchanged verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamsResponse {
    pub params_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OprfRequest {
    pub blinded: Vec<OprfPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OprfResponse {
    pub evaluated: Vec<OprfPoint>,
}

/// Encrypted query, one ciphertext per bundle index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub params_fingerprint: u64,
    pub context_id: u64,
    pub bundles: Vec<Ciphertext>,
}

/// Announces how many result parts follow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub context_id: u64,
    pub package_count: u32,
}

/// Answer of one bin bundle, self-contained
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPart {
    pub context_id: u64,
    pub bundle_idx: u32,
    pub label_byte_count: u32,
    pub nonce_byte_count: u32,
    pub matches: Ciphertext,
    pub label_planes: Vec<Ciphertext>,
}

impl QueryRequest {
    fn context_ids(&self) -> impl Iterator<Item = u64> + '_ {
        std::iter::once(self.context_id).chain(self.bundles.iter().map(|c| c.context_id))
    }
}

impl ResultPart {
    fn context_ids(&self) -> impl Iterator<Item = u64> + '_ {
        [self.context_id, self.matches.context_id]
            .into_iter()
            .chain(self.label_planes.iter().map(|c| c.context_id))
    }
}

/// Any protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ParamsRequest(ParamsRequest),
    ParamsResponse(ParamsResponse),
    OprfRequest(OprfRequest),
    OprfResponse(OprfResponse),
    QueryRequest(QueryRequest),
    QueryResponse(QueryResponse),
    ResultPart(ResultPart),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ParamsRequest(_) => MessageKind::ParamsRequest,
            Message::ParamsResponse(_) => MessageKind::ParamsResponse,
            Message::OprfRequest(_) => MessageKind::OprfRequest,
            Message::OprfResponse(_) => MessageKind::OprfResponse,
            Message::QueryRequest(_) => MessageKind::QueryRequest,
            Message::QueryResponse(_) => MessageKind::QueryResponse,
            Message::ResultPart(_) => MessageKind::ResultPart,
        }
    }
}

/// Sender-bound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Params(ParamsRequest),
    Oprf(OprfRequest),
    Query(QueryRequest),
}

impl Request {
    pub fn operation(&self) -> OperationKind {
        match self {
            Request::Params(_) => OperationKind::Params,
            Request::Oprf(_) => OperationKind::Oprf,
            Request::Query(_) => OperationKind::Query,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        match request {
            Request::Params(r) => Message::ParamsRequest(r),
            Request::Oprf(r) => Message::OprfRequest(r),
            Request::Query(r) => Message::QueryRequest(r),
        }
    }
}

impl TryFrom<Message> for Request {
    type Error = Error;

    fn try_from(message: Message) -> Result<Self> {
        match message {
            Message::ParamsRequest(r) => Ok(Request::Params(r)),
            Message::OprfRequest(r) => Ok(Request::Oprf(r)),
            Message::QueryRequest(r) => Ok(Request::Query(r)),
            other => Err(Error::MalformedMessage(format!(
                "expected a request, got {}",
                other.kind()
            ))),
        }
    }
}

/// Receiver-bound reply to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Params(ParamsResponse),
    Oprf(OprfResponse),
    Query(QueryResponse),
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        match response {
            Response::Params(r) => Message::ParamsResponse(r),
            Response::Oprf(r) => Message::OprfResponse(r),
            Response::Query(r) => Message::QueryResponse(r),
        }
    }
}

impl TryFrom<Message> for Response {
    type Error = Error;

    fn try_from(message: Message) -> Result<Self> {
        match message {
            Message::ParamsResponse(r) => Ok(Response::Params(r)),
            Message::OprfResponse(r) => Ok(Response::Oprf(r)),
            Message::QueryResponse(r) => Ok(Response::Query(r)),
            other => Err(Error::MalformedMessage(format!(
                "expected a response, got {}",
                other.kind()
            ))),
        }
    }
}

fn body_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| Error::MalformedMessage(format!("failed to encode body: {}", e)))
}

/// Encode a message into a complete frame
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let body = match message {
        Message::ParamsRequest(m) => body_bytes(m)?,
        Message::ParamsResponse(m) => body_bytes(m)?,
        Message::OprfRequest(m) => body_bytes(m)?,
        Message::OprfResponse(m) => body_bytes(m)?,
        Message::QueryRequest(m) => body_bytes(m)?,
        Message::QueryResponse(m) => body_bytes(m)?,
        Message::ResultPart(m) => body_bytes(m)?,
    };

    let header = FrameHeader::new(message.kind(), body.len() as u64);
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a complete frame, requiring it to be of `expected` kind
pub fn decode(
    bytes: &[u8],
    expected: MessageKind,
    context: Option<&CryptoContext>,
) -> Result<Message> {
    let header = FrameHeader::from_bytes(bytes)?;
    if header.kind != expected {
        return Err(Error::MalformedMessage(format!(
            "expected {}, got {}",
            expected, header.kind
        )));
    }
    let body = &bytes[HEADER_SIZE..];
    if body.len() as u64 != header.body_len {
        return Err(Error::MalformedMessage(format!(
            "header declares {} body bytes, {} available",
            header.body_len,
            body.len()
        )));
    }
    decode_body(header.kind, body, context)
}

fn parse<'a, T: Deserialize<'a>>(kind: MessageKind, body: &'a [u8]) -> Result<T> {
    bincode::deserialize(body)
        .map_err(|e| Error::MalformedMessage(format!("failed to decode {} body: {}", kind, e)))
}

fn check_context(
    kind: MessageKind,
    context: Option<&CryptoContext>,
    mut ids: impl Iterator<Item = u64>,
) -> Result<()> {
    let first = ids.next().unwrap_or_default();
    let Some(context) = context else {
        return Err(Error::ContextMismatch {
            kind,
            expected: 0,
            actual: first,
        });
    };
    for id in std::iter::once(first).chain(ids) {
        if id != context.id {
            return Err(Error::ContextMismatch {
                kind,
                expected: context.id,
                actual: id,
            });
        }
    }
    Ok(())
}

/// Decode a body whose header has already been validated
pub fn decode_body(
    kind: MessageKind,
    body: &[u8],
    context: Option<&CryptoContext>,
) -> Result<Message> {
    let message = match kind {
        MessageKind::ParamsRequest => Message::ParamsRequest(parse(kind, body)?),
        MessageKind::ParamsResponse => Message::ParamsResponse(parse(kind, body)?),
        MessageKind::OprfRequest => Message::OprfRequest(parse(kind, body)?),
        MessageKind::OprfResponse => Message::OprfResponse(parse(kind, body)?),
        MessageKind::QueryRequest => {
            let request: QueryRequest = parse(kind, body)?;
            check_context(kind, context, request.context_ids())?;
            Message::QueryRequest(request)
        }
        MessageKind::QueryResponse => {
            let response: QueryResponse = parse(kind, body)?;
            check_context(kind, context, std::iter::once(response.context_id))?;
            Message::QueryResponse(response)
        }
        MessageKind::ResultPart => {
            let part: ResultPart = parse(kind, body)?;
            check_context(kind, context, part.context_ids())?;
            Message::ResultPart(part)
        }
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::test_params;

    fn context() -> CryptoContext {
        CryptoContext::from_params(&test_params())
    }

    fn sample_part(context_id: u64) -> ResultPart {
        ResultPart {
            context_id,
            bundle_idx: 0,
            label_byte_count: 4,
            nonce_byte_count: 16,
            matches: Ciphertext { context_id, body: vec![1, 2, 3] },
            label_planes: vec![Ciphertext { context_id, body: vec![4] }],
        }
    }

    #[test]
    fn test_header_layout() {
        let header = FrameHeader::new(MessageKind::OprfRequest, 42);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"VPSI");
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 3);
        assert_eq!(FrameHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_oprf_request_frame() {
        let message = Message::OprfRequest(OprfRequest { blinded: vec![[7u8; 32]; 3] });
        let frame = encode(&message).unwrap();
        let decoded = decode(&frame, MessageKind::OprfRequest, None).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_kind_mismatch_is_malformed() {
        let frame = encode(&Message::ParamsRequest(ParamsRequest)).unwrap();
        assert!(matches!(
            decode(&frame, MessageKind::OprfRequest, None),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_truncated_and_padded_frames_rejected() {
        let message = Message::ParamsResponse(ParamsResponse { params_json: "{}".into() });
        let frame = encode(&message).unwrap();

        let short = &frame[..frame.len() - 1];
        assert!(matches!(
            decode(short, MessageKind::ParamsResponse, None),
            Err(Error::MalformedMessage(_))
        ));

        let mut long = frame.clone();
        long.push(0);
        assert!(matches!(
            decode(&long, MessageKind::ParamsResponse, None),
            Err(Error::MalformedMessage(_))
        ));

        assert!(matches!(
            decode(&frame[..8], MessageKind::ParamsResponse, None),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut frame = encode(&Message::ParamsRequest(ParamsRequest)).unwrap();
        frame[0] = b'X';
        assert!(FrameHeader::from_bytes(&frame).is_err());

        let mut frame = encode(&Message::ParamsRequest(ParamsRequest)).unwrap();
        frame[4] = 9;
        assert!(FrameHeader::from_bytes(&frame).is_err());
    }

    #[test]
    fn test_result_part_requires_matching_context() {
        let ctx = context();
        let frame = encode(&Message::ResultPart(sample_part(ctx.id))).unwrap();
        assert!(decode(&frame, MessageKind::ResultPart, Some(&ctx)).is_ok());

        let other = CryptoContext { id: ctx.id ^ 0xff, ..ctx };
        assert!(matches!(
            decode(&frame, MessageKind::ResultPart, Some(&other)),
            Err(Error::ContextMismatch { kind: MessageKind::ResultPart, .. })
        ));
        assert!(matches!(
            decode(&frame, MessageKind::ResultPart, None),
            Err(Error::ContextMismatch { .. })
        ));
    }

    #[test]
    fn test_mixed_ciphertext_contexts_rejected() {
        let ctx = context();
        let mut part = sample_part(ctx.id);
        part.label_planes[0].context_id = 1;
        let frame = encode(&Message::ResultPart(part)).unwrap();
        assert!(matches!(
            decode(&frame, MessageKind::ResultPart, Some(&ctx)),
            Err(Error::ContextMismatch { actual: 1, .. })
        ));
    }

    #[test]
    fn test_request_conversion() {
        let request = Request::Oprf(OprfRequest { blinded: vec![] });
        assert_eq!(request.operation(), OperationKind::Oprf);
        let message: Message = request.clone().into();
        assert_eq!(Request::try_from(message).unwrap(), request);
        assert!(Request::try_from(Message::QueryResponse(QueryResponse {
            context_id: 0,
            package_count: 0
        }))
        .is_err());
    }
}
