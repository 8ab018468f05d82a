//! Copy-paste tokens for exchanging signaling envelopes without a shared bus.
//!
//! A token is the JSON array of envelopes, gzip-compressed and base64 encoded (URL-safe, no
//! padding) so it survives chat clients and QR codes. A description and its candidates can
//! travel in one token.

use super::SignalingEnvelope;
use crate::error::SessionError;
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

/// Upper bound on the decompressed size of a token
pub const MAX_TOKEN_BYTES: u64 = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("token compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("token expands beyond {MAX_TOKEN_BYTES} bytes")]
    TooLarge,

    #[error("token does not contain signaling envelopes: {0}")]
    Json(#[from] serde_json::Error),

    #[error("token is empty")]
    Empty,
}

impl From<TokenError> for SessionError {
    fn from(e: TokenError) -> Self {
        SessionError::Signaling(e.to_string())
    }
}

pub fn encode(envelopes: &[SignalingEnvelope]) -> Result<String, TokenError> {
    let json = serde_json::to_vec(envelopes)?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::best());
    gz.write_all(&json)?;
    let compressed = gz.finish()?;
    Ok(general_purpose::URL_SAFE_NO_PAD.encode(compressed))
}

pub fn decode(token: &str) -> Result<Vec<SignalingEnvelope>, TokenError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }
    let compressed = general_purpose::URL_SAFE_NO_PAD.decode(token)?;
    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .take(MAX_TOKEN_BYTES + 1)
        .read_to_end(&mut json)?;
    if json.len() as u64 > MAX_TOKEN_BYTES {
        return Err(TokenError::TooLarge);
    }
    let envelopes: Vec<SignalingEnvelope> = serde_json::from_slice(&json)?;
    if envelopes.is_empty() {
        return Err(TokenError::Empty);
    }
    Ok(envelopes)
}
