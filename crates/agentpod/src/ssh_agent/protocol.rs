//! SSH agent wire format (draft-miller-ssh-agent).
//!
//! Only the pieces the proxy needs: framing, the identities answer, and the
//! key blob of a sign request. Everything else is relayed as opaque bytes.

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from either side.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

// Requests from client
pub const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
pub const SSH_AGENTC_ADD_IDENTITY: u8 = 17;
pub const SSH_AGENTC_REMOVE_IDENTITY: u8 = 18;
pub const SSH_AGENTC_REMOVE_ALL_IDENTITIES: u8 = 19;
pub const SSH_AGENTC_ADD_SMARTCARD_KEY: u8 = 20;
pub const SSH_AGENTC_REMOVE_SMARTCARD_KEY: u8 = 21;
pub const SSH_AGENTC_LOCK: u8 = 22;
pub const SSH_AGENTC_UNLOCK: u8 = 23;
pub const SSH_AGENTC_ADD_ID_CONSTRAINED: u8 = 25;
pub const SSH_AGENTC_ADD_SMARTCARD_KEY_CONSTRAINED: u8 = 26;
pub const SSH_AGENTC_EXTENSION: u8 = 27;

// Responses from agent
pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;
pub const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH_AGENT_SIGN_RESPONSE: u8 = 14;

/// Requests that add, remove or lock keys in the upstream agent.
pub fn is_key_management(msg_type: u8) -> bool {
    matches!(
        msg_type,
        SSH_AGENTC_ADD_IDENTITY
            | SSH_AGENTC_REMOVE_IDENTITY
            | SSH_AGENTC_REMOVE_ALL_IDENTITIES
            | SSH_AGENTC_ADD_SMARTCARD_KEY
            | SSH_AGENTC_REMOVE_SMARTCARD_KEY
            | SSH_AGENTC_LOCK
            | SSH_AGENTC_UNLOCK
            | SSH_AGENTC_ADD_ID_CONSTRAINED
            | SSH_AGENTC_ADD_SMARTCARD_KEY_CONSTRAINED
    )
}

/// Malformed agent message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message truncated")]
    Truncated,
    #[error("unexpected message type {0}")]
    UnexpectedType(u8),
    #[error("trailing bytes after message")]
    TrailingBytes,
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the connection on a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "message too large")
    })?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// A single-byte failure payload.
pub fn failure() -> Vec<u8> {
    vec![SSH_AGENT_FAILURE]
}

/// A public key as reported by the agent.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub blob: Vec<u8>,
    /// Comment as text, for matching and logs. Invalid UTF-8 is replaced.
    pub comment: String,
    /// Comment exactly as the agent sent it.
    raw_comment: Vec<u8>,
}

impl AgentIdentity {
    pub fn new(blob: impl Into<Vec<u8>>, comment: impl Into<String>) -> Self {
        let comment = comment.into();
        Self {
            blob: blob.into(),
            raw_comment: comment.as_bytes().to_vec(),
            comment,
        }
    }

    fn from_wire(blob: Vec<u8>, raw_comment: Vec<u8>) -> Self {
        Self {
            blob,
            comment: String::from_utf8_lossy(&raw_comment).into_owned(),
            raw_comment,
        }
    }

    /// OpenSSH-style fingerprint, e.g. `SHA256:47DEQpj8...`.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.blob)
    }
}

impl std::fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("fingerprint", &self.fingerprint())
            .field("comment", &self.comment)
            .finish()
    }
}

/// Fingerprint of a raw public key blob.
pub fn fingerprint(blob: &[u8]) -> String {
    let digest = Sha256::digest(blob);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn byte(&mut self) -> Result<u8, ProtocolError> {
        let (&first, rest) = self.buf.split_first().ok_or(ProtocolError::Truncated)?;
        self.buf = rest;
        Ok(first)
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        if self.buf.len() < 4 {
            return Err(ProtocolError::Truncated);
        }
        let (head, rest) = self.buf.split_at(4);
        self.buf = rest;
        Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
    }

    fn string(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.u32()? as usize;
        if self.buf.len() < len {
            return Err(ProtocolError::Truncated);
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

fn put_string(out: &mut Vec<u8>, data: &[u8]) {
    // Frame size is capped well below u32::MAX.
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

/// Parse an `SSH_AGENT_IDENTITIES_ANSWER` payload.
pub fn parse_identities_answer(payload: &[u8]) -> Result<Vec<AgentIdentity>, ProtocolError> {
    let mut reader = Reader::new(payload);
    let msg_type = reader.byte()?;
    if msg_type != SSH_AGENT_IDENTITIES_ANSWER {
        return Err(ProtocolError::UnexpectedType(msg_type));
    }

    let count = reader.u32()? as usize;
    // Each identity needs at least two length prefixes.
    let mut identities = Vec::with_capacity(count.min(payload.len() / 8));
    for _ in 0..count {
        let blob = reader.string()?.to_vec();
        let comment = reader.string()?.to_vec();
        identities.push(AgentIdentity::from_wire(blob, comment));
    }

    if !reader.is_empty() {
        return Err(ProtocolError::TrailingBytes);
    }
    Ok(identities)
}

/// Build an `SSH_AGENT_IDENTITIES_ANSWER` payload.
pub fn encode_identities_answer(identities: &[AgentIdentity]) -> Vec<u8> {
    let mut out = vec![SSH_AGENT_IDENTITIES_ANSWER];
    out.extend_from_slice(&(identities.len() as u32).to_be_bytes());
    for identity in identities {
        put_string(&mut out, &identity.blob);
        put_string(&mut out, &identity.raw_comment);
    }
    out
}

/// Build an `SSH_AGENTC_SIGN_REQUEST` payload.
pub fn encode_sign_request(key_blob: &[u8], data: &[u8], flags: u32) -> Vec<u8> {
    let mut out = vec![SSH_AGENTC_SIGN_REQUEST];
    put_string(&mut out, key_blob);
    put_string(&mut out, data);
    out.extend_from_slice(&flags.to_be_bytes());
    out
}

/// Extract the key blob from an `SSH_AGENTC_SIGN_REQUEST` payload.
///
/// Format: `type(1) | string key_blob | string data | uint32 flags`.
pub fn sign_request_key(payload: &[u8]) -> Result<&[u8], ProtocolError> {
    let mut reader = Reader::new(payload);
    let msg_type = reader.byte()?;
    if msg_type != SSH_AGENTC_SIGN_REQUEST {
        return Err(ProtocolError::UnexpectedType(msg_type));
    }
    let key = reader.string()?;
    reader.string()?;
    reader.u32()?;
    if !reader.is_empty() {
        return Err(ProtocolError::TrailingBytes);
    }
    Ok(key)
}
