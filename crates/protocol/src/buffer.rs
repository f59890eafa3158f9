//! Base64-encoded binary payloads.
//!
//! The protocol is JSON end to end; binary results (screenshots, PDFs) are
//! returned wholesale as base64 strings and decoded on the client side.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// A binary payload carried over the wire as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Buffer(String);

impl Buffer {
    /// Encodes raw bytes into a wire buffer.
    pub fn encode(bytes: &[u8]) -> Self {
        Self(STANDARD.encode(bytes))
    }

    /// Decodes the buffer back into raw bytes.
    ///
    /// Returns `None` if the payload is not valid base64.
    pub fn decode(&self) -> Option<Vec<u8>> {
        STANDARD.decode(&self.0).ok()
    }

    /// Returns the raw base64 text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Self::encode(bytes)
    }
}
