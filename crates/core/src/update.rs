//! Replicated update messages

use serde::{Deserialize, Serialize};

use crate::csn::Csn;
use crate::error::{ChangelogError, ChangelogResult};

/// One update originated by a replica
///
/// The payload is the protocol layer's encoding of the operation and is
/// opaque to the changelog. The CSN travels beside it so that logs never
/// need to look inside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMsg {
    csn: Csn,
    payload: Vec<u8>,
}

impl UpdateMsg {
    /// Create an update
    pub fn new(csn: Csn, payload: impl Into<Vec<u8>>) -> Self {
        UpdateMsg {
            csn,
            payload: payload.into(),
        }
    }

    /// CSN stamped by the originating replica
    pub fn csn(&self) -> Csn {
        self.csn
    }

    /// Originating replica id
    pub fn server_id(&self) -> i32 {
        self.csn.server_id()
    }

    /// Opaque operation bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume into the payload
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Serialize to bytes
    pub fn encode(&self) -> ChangelogResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes
    pub fn decode(bytes: &[u8]) -> ChangelogResult<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| ChangelogError::parse(format!("invalid update message: {}", e)))
    }
}
