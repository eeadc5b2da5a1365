//! Client operations carried inside log entries.
//!
//! A `DistributedOperation` is identified by the global session that issued
//! it plus a local operation id; the session tracker uses that pair to apply
//! each operation at most once.
//!
//! # Wire format
//!
//! ```text
//! +--------------+---------------------------------------------------+
//! | content type | bincode (GlobalSession, LocalOperationId, request) |
//! | 1B           | variable                                          |
//! +--------------+---------------------------------------------------+
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::kernel::snapshot::StateKind;

// =============================================================================
// IDENTITIES
// =============================================================================

/// Cluster member identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(pub Uuid);

impl MemberId {
    /// Fresh random member id.
    pub fn random() -> Self {
        MemberId(Uuid::new_v4())
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId{{{}}}", &self.0.to_string()[..8])
    }
}

/// A client session as seen by the whole cluster.
///
/// A member restarts with a fresh `session_id`; the tracker treats that as a
/// brand new session for the owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalSession {
    pub session_id: Uuid,
    pub owner: MemberId,
}

impl GlobalSession {
    pub fn new(session_id: Uuid, owner: MemberId) -> Self {
        GlobalSession { session_id, owner }
    }
}

/// Position of an operation within a global session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalOperationId {
    pub local_session_id: u64,
    pub sequence_number: u64,
}

impl LocalOperationId {
    pub fn new(local_session_id: u64, sequence_number: u64) -> Self {
        LocalOperationId {
            local_session_id,
            sequence_number,
        }
    }
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Entity kinds whose ids are handed out in ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdType {
    Node,
    Relationship,
    Property,
    Schema,
}

/// Token namespaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TokenType {
    Label,
    PropertyKey,
    RelationshipType,
}

/// A committed transaction, opaque to the applier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Lock token the transaction was prepared under.
    pub lock_session_id: i64,
    pub payload: Vec<u8>,
}

/// Request for a contiguous range of ids.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocationRequest {
    pub owner: MemberId,
    pub id_type: IdType,
    pub range_start: u64,
    pub range_length: u32,
}

/// Request to create (or look up) a named token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub token_type: TokenType,
    pub name: String,
}

/// Request to take over the cluster-wide lock token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTokenRequest {
    pub owner: MemberId,
    pub candidate_id: u64,
}

/// No-op traffic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DummyRequest {
    pub payload: Vec<u8>,
}

// =============================================================================
// CONTENT
// =============================================================================

/// Discriminant byte written ahead of every encoded operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    Transaction = 0,
    IdAllocation = 1,
    TokenAllocation = 2,
    LockToken = 3,
    Dummy = 4,
}

impl ContentType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ContentType::Transaction),
            1 => Some(ContentType::IdAllocation),
            2 => Some(ContentType::TokenAllocation),
            3 => Some(ContentType::LockToken),
            4 => Some(ContentType::Dummy),
            _ => None,
        }
    }
}

/// Payload of a client operation. One variant per state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationContent {
    Transaction(TransactionRequest),
    IdAllocation(IdAllocationRequest),
    TokenAllocation(TokenRequest),
    LockToken(LockTokenRequest),
    Dummy(DummyRequest),
}

impl OperationContent {
    pub fn content_type(&self) -> ContentType {
        match self {
            OperationContent::Transaction(_) => ContentType::Transaction,
            OperationContent::IdAllocation(_) => ContentType::IdAllocation,
            OperationContent::TokenAllocation(_) => ContentType::TokenAllocation,
            OperationContent::LockToken(_) => ContentType::LockToken,
            OperationContent::Dummy(_) => ContentType::Dummy,
        }
    }

    /// State machine responsible for this content.
    pub fn kind(&self) -> StateKind {
        match self {
            OperationContent::Transaction(_) => StateKind::Transaction,
            OperationContent::IdAllocation(_) => StateKind::IdAllocation,
            OperationContent::TokenAllocation(_) => StateKind::Token,
            OperationContent::LockToken(_) => StateKind::LockToken,
            OperationContent::Dummy(_) => StateKind::Dummy,
        }
    }
}

// =============================================================================
// DISTRIBUTED OPERATION
// =============================================================================

/// Error decoding an operation.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Empty operation buffer")]
    Empty,

    #[error("Unknown content type: {0}")]
    UnknownContentType(u8),

    #[error("Operation body: {0}")]
    Serialization(#[from] bincode::Error),
}

/// A client operation replicated through the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedOperation {
    pub global_session: GlobalSession,
    pub operation_id: LocalOperationId,
    pub content: OperationContent,
}

impl DistributedOperation {
    pub fn new(
        global_session: GlobalSession,
        operation_id: LocalOperationId,
        content: OperationContent,
    ) -> Self {
        DistributedOperation {
            global_session,
            operation_id,
            content,
        }
    }

    /// Encode as discriminant byte followed by the bincode body.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![self.content.content_type() as u8];
        let session = (&self.global_session, &self.operation_id);
        let body = match &self.content {
            OperationContent::Transaction(r) => bincode::serialize(&(session, r))?,
            OperationContent::IdAllocation(r) => bincode::serialize(&(session, r))?,
            OperationContent::TokenAllocation(r) => bincode::serialize(&(session, r))?,
            OperationContent::LockToken(r) => bincode::serialize(&(session, r))?,
            OperationContent::Dummy(r) => bincode::serialize(&(session, r))?,
        };
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode bytes produced by `encode`.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (&tag, body) = bytes.split_first().ok_or(CodecError::Empty)?;
        let content_type = ContentType::from_byte(tag).ok_or(CodecError::UnknownContentType(tag))?;

        match content_type {
            ContentType::Transaction => decode_body(body, OperationContent::Transaction),
            ContentType::IdAllocation => decode_body(body, OperationContent::IdAllocation),
            ContentType::TokenAllocation => decode_body(body, OperationContent::TokenAllocation),
            ContentType::LockToken => decode_body(body, OperationContent::LockToken),
            ContentType::Dummy => decode_body(body, OperationContent::Dummy),
        }
    }
}

fn decode_body<R: DeserializeOwned>(
    body: &[u8],
    wrap: fn(R) -> OperationContent,
) -> Result<DistributedOperation, CodecError> {
    let ((global_session, operation_id), request): ((GlobalSession, LocalOperationId), R) =
        bincode::deserialize(body)?;
    Ok(DistributedOperation::new(
        global_session,
        operation_id,
        wrap(request),
    ))
}
