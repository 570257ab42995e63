//! Input normalization for the three request shapes: a JSON `text` field, a
//! multipart upload and a raw request body.

use serde::Deserialize;

use crate::error::ApiError;

/// Default ceiling for uploaded files and raw bodies.
pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
/// Characters forwarded to the model; anything past this is dropped.
pub const MAX_TEXT_CHARS: usize = 200_000;
/// Characters of the original text kept in a scan record.
pub const PREVIEW_CHARS: usize = 200;

pub const DEFAULT_MAX_LABELS: u32 = 10;
const MAX_LABELS_RANGE: std::ops::RangeInclusive<u32> = 1..=50;

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzeTextRequest {
    pub text: String,
    #[serde(default)]
    pub max_labels: Option<u32>,
}

impl AnalyzeTextRequest {
    /// Effective label cap, validated against the accepted range.
    pub fn max_labels(&self) -> Result<u32, ApiError> {
        let value = self.max_labels.unwrap_or(DEFAULT_MAX_LABELS);
        if MAX_LABELS_RANGE.contains(&value) {
            Ok(value)
        } else {
            Err(ApiError::InvalidRequest(format!(
                "max_labels must be between {} and {}",
                MAX_LABELS_RANGE.start(),
                MAX_LABELS_RANGE.end()
            )))
        }
    }
}

/// Reject blobs above `limit` bytes. `what` names the input in the message.
pub fn ensure_within_limit(len: usize, limit: usize, what: &str) -> Result<(), ApiError> {
    if len > limit {
        return Err(ApiError::PayloadTooLarge(format!(
            "{} too large ({} bytes > limit {} bytes)",
            what, len, limit
        )));
    }
    Ok(())
}

/// Decode as UTF-8, falling back to ISO-8859-1 which maps every byte to the
/// code point of the same value and so cannot fail.
pub fn decode_text(blob: &[u8]) -> String {
    match std::str::from_utf8(blob) {
        Ok(text) => text.to_owned(),
        Err(err) => {
            tracing::debug!(valid_up_to = err.valid_up_to(), "input is not UTF-8; decoding as latin-1");
            blob.iter().map(|&b| char::from(b)).collect()
        }
    }
}

/// Size-check and decode an uploaded file or raw body.
pub fn normalize_blob(blob: &[u8], limit: usize, what: &str) -> Result<String, ApiError> {
    ensure_within_limit(blob.len(), limit, what)?;
    Ok(decode_text(blob))
}

/// First `max_chars` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
