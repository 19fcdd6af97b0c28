//! SSH agent wire protocol
//!
//! Records are `uint32` big-endian length, one type byte, then type-specific
//! fields. Every request is decoded into the closed [`AgentRequest`] set up
//! front; anything that fails to decode is answered with the fixed failure
//! record and never closes the channel.

use bytes::{BufMut, Bytes, BytesMut};
use russh::keys::PrivateKey;
use thiserror::Error;
use zeroize::Zeroizing;

use super::keys;

/// Message type numbers
pub mod msg {
    pub const FAILURE: u8 = 5;
    pub const SUCCESS: u8 = 6;
    pub const REQUEST_IDENTITIES: u8 = 11;
    pub const IDENTITIES_ANSWER: u8 = 12;
    pub const SIGN_REQUEST: u8 = 13;
    pub const SIGN_RESPONSE: u8 = 14;
    pub const ADD_IDENTITY: u8 = 17;
    pub const REMOVE_IDENTITY: u8 = 18;
    pub const REMOVE_ALL_IDENTITIES: u8 = 19;
    pub const LOCK: u8 = 22;
    pub const UNLOCK: u8 = 23;
    pub const ADD_ID_CONSTRAINED: u8 = 25;
}

/// Constraint type numbers for add-identity-constrained
pub mod constraint {
    pub const LIFETIME: u8 = 1;
    pub const CONFIRM: u8 = 2;
}

/// Sign request flag bits
pub mod sign_flags {
    pub const RSA_SHA2_256: u32 = 2;
    pub const RSA_SHA2_512: u32 = 4;
    pub const KNOWN: u32 = RSA_SHA2_256 | RSA_SHA2_512;
}

/// Canonical failure record
pub const FAILURE_RECORD: [u8; 5] = [0, 0, 0, 1, msg::FAILURE];
/// Canonical success record
pub const SUCCESS_RECORD: [u8; 5] = [0, 0, 0, 1, msg::SUCCESS];

/// Largest record accepted from the peer
pub const MAX_RECORD_LEN: usize = 256 * 1024;

/// Why a request could not be served
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Truncated agent message")]
    Truncated,

    #[error("Empty agent record")]
    EmptyRecord,

    #[error("Invalid UTF-8 in agent message")]
    InvalidUtf8,

    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Unknown constraint type {0}")]
    UnknownConstraint(u8),

    #[error("Unsupported sign flags {0:#x}")]
    UnsupportedFlags(u32),

    #[error("Signing failed: {0}")]
    SignFailed(String),
}

/// Constraints attached to an added identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    pub confirm: bool,
    pub lifetime_secs: Option<u32>,
}

/// A decoded agent request
pub enum AgentRequest {
    RequestIdentities,
    SignRequest {
        key_blob: Vec<u8>,
        data: Vec<u8>,
        flags: u32,
    },
    AddIdentity {
        key: PrivateKey,
        constraints: Constraints,
    },
    RemoveIdentity {
        key_blob: Vec<u8>,
    },
    RemoveAll,
    Lock {
        passphrase: Zeroizing<Vec<u8>>,
    },
    Unlock {
        passphrase: Zeroizing<Vec<u8>>,
    },
    Unsupported(u8),
}

impl std::fmt::Debug for AgentRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRequest::RequestIdentities => write!(f, "RequestIdentities"),
            AgentRequest::SignRequest { data, flags, .. } => {
                write!(f, "SignRequest({} bytes, flags {:#x})", data.len(), flags)
            }
            AgentRequest::AddIdentity { key, constraints } => {
                write!(f, "AddIdentity({}, {:?})", key.algorithm().as_str(), constraints)
            }
            AgentRequest::RemoveIdentity { .. } => write!(f, "RemoveIdentity"),
            AgentRequest::RemoveAll => write!(f, "RemoveAll"),
            AgentRequest::Lock { .. } => write!(f, "Lock"),
            AgentRequest::Unlock { .. } => write!(f, "Unlock"),
            AgentRequest::Unsupported(t) => write!(f, "Unsupported({})", t),
        }
    }
}

/// A response ready to be framed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
    Success,
    Failure,
    Identities(Vec<(Vec<u8>, String)>),
    Signature(Vec<u8>),
}

/// Bounds-checked reader over SSH wire types
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], AgentError> {
        if self.buf.len() < n {
            return Err(AgentError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8, AgentError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, AgentError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_string(&mut self) -> Result<&'a [u8], AgentError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    pub fn read_utf8(&mut self) -> Result<&'a str, AgentError> {
        std::str::from_utf8(self.read_string()?).map_err(|_| AgentError::InvalidUtf8)
    }
}

/// Append an SSH `string`
pub fn put_string(out: &mut BytesMut, data: &[u8]) {
    out.put_u32(data.len() as u32);
    out.put_slice(data);
}

/// Read constraint records until the end of the message
fn decode_constraints(reader: &mut WireReader<'_>) -> Result<Constraints, AgentError> {
    let mut constraints = Constraints::default();
    while !reader.is_empty() {
        match reader.read_u8()? {
            constraint::LIFETIME => constraints.lifetime_secs = Some(reader.read_u32()?),
            constraint::CONFIRM => constraints.confirm = true,
            other => return Err(AgentError::UnknownConstraint(other)),
        }
    }
    Ok(constraints)
}

impl AgentRequest {
    /// Decode one record body (type byte plus payload, without the length)
    pub fn decode(record: &[u8]) -> Result<Self, AgentError> {
        let (&kind, payload) = record.split_first().ok_or(AgentError::EmptyRecord)?;
        let mut reader = WireReader::new(payload);

        let request = match kind {
            msg::REQUEST_IDENTITIES => AgentRequest::RequestIdentities,
            msg::SIGN_REQUEST => {
                let key_blob = reader.read_string()?.to_vec();
                let data = reader.read_string()?.to_vec();
                let flags = reader.read_u32()?;
                AgentRequest::SignRequest {
                    key_blob,
                    data,
                    flags,
                }
            }
            msg::ADD_IDENTITY | msg::ADD_ID_CONSTRAINED => {
                let key = keys::decode_identity(&mut reader)?;
                let constraints = if kind == msg::ADD_ID_CONSTRAINED {
                    decode_constraints(&mut reader)?
                } else {
                    Constraints::default()
                };
                AgentRequest::AddIdentity { key, constraints }
            }
            msg::REMOVE_IDENTITY => AgentRequest::RemoveIdentity {
                key_blob: reader.read_string()?.to_vec(),
            },
            msg::REMOVE_ALL_IDENTITIES => AgentRequest::RemoveAll,
            msg::LOCK => AgentRequest::Lock {
                passphrase: Zeroizing::new(reader.read_string()?.to_vec()),
            },
            msg::UNLOCK => AgentRequest::Unlock {
                passphrase: Zeroizing::new(reader.read_string()?.to_vec()),
            },
            other => AgentRequest::Unsupported(other),
        };
        Ok(request)
    }
}

impl AgentResponse {
    /// Frame the response as a complete record
    pub fn encode(&self) -> Bytes {
        match self {
            AgentResponse::Success => Bytes::from_static(&SUCCESS_RECORD),
            AgentResponse::Failure => Bytes::from_static(&FAILURE_RECORD),
            AgentResponse::Identities(identities) => {
                let mut body = BytesMut::new();
                body.put_u8(msg::IDENTITIES_ANSWER);
                body.put_u32(identities.len() as u32);
                for (blob, comment) in identities {
                    put_string(&mut body, blob);
                    put_string(&mut body, comment.as_bytes());
                }
                frame(body)
            }
            AgentResponse::Signature(signature) => {
                let mut body = BytesMut::new();
                body.put_u8(msg::SIGN_RESPONSE);
                put_string(&mut body, signature);
                frame(body)
            }
        }
    }
}

fn frame(body: BytesMut) -> Bytes {
    let mut out = BytesMut::with_capacity(body.len() + 4);
    out.put_u32(body.len() as u32);
    out.extend_from_slice(&body);
    out.freeze()
}

/// Split one complete record off the front of `buf`.
///
/// Returns `Ok(None)` while the record is still incomplete, and an error
/// when the announced length exceeds [`MAX_RECORD_LEN`].
pub fn take_record(buf: &mut BytesMut) -> Result<Option<BytesMut>, usize> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_RECORD_LEN {
        return Err(len);
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let mut record = buf.split_to(4 + len);
    let _ = record.split_to(4);
    Ok(Some(record))
}
