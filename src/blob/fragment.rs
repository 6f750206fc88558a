//! Wire format of one BLOB fragment message (§4.3 "Fragment format" / §6).
//!
//! A fragment travels as an ordinary [`Message`] whose `message_id` is the
//! manipulator's fixed "fragment" id; the fields below are the payload
//! prefix carried inside that message, followed by the raw fragment bytes.

use crate::message::MessageId;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Options carried once, on the first fragment (offset 0) of a BLOB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobOptions {
    pub compressed: bool,
    pub with_metadata: bool,
}

/// The payload prefix of a fragment message, preceding the raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentHeader {
    pub source_blob_id: u64,
    pub target_blob_id: u64,
    pub offset: u64,
    pub total_size: u64,
    /// The logical message id this BLOB represents once reassembled.
    pub carried_message_id: MessageId,
    /// Only meaningful (and only sent) on the first fragment, `offset == 0`.
    pub options: Option<BlobOptions>,
}

/// One fragment: header plus the bytes it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub bytes: Vec<u8>,
}

impl Fragment {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| anyhow!("malformed blob fragment: {}", e))
    }
}
