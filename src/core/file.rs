//! Reading elementary files that are larger than a single response.

use serde::{Deserialize, Serialize};

use crate::core::apdu::{exchange, ApduCommand, StatusWord};
use crate::core::error::{CardError, Result};
use crate::core::transport::CardSession;

/// Bytes requested per READ BINARY. Two bytes of the response buffer are
/// reserved for the status word and cards differ on whether Le=0xFF is valid.
pub const MAX_CHUNK: usize = 0xFD;

/// How a status word returned during a read is to be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Success,
    /// The card ran out of file; data collected so far stands
    RecoverableTruncation,
    Fatal,
}

/// Status words a pipeline accepts while reading a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPolicy {
    pub success: Vec<StatusWord>,
    #[serde(default)]
    pub end_of_file: Vec<StatusWord>,
}

impl ReadPolicy {
    pub fn classify(&self, status: StatusWord) -> StatusOutcome {
        if self.success.contains(&status) {
            StatusOutcome::Success
        } else if self.end_of_file.contains(&status) {
            StatusOutcome::RecoverableTruncation
        } else {
            StatusOutcome::Fatal
        }
    }
}

/// Read `total` bytes of the selected EF starting at `offset`.
///
/// An end-of-file status after at least one successful chunk ends the read
/// with the bytes collected so far. The same status on the first chunk, or
/// any status outside the policy, fails the read.
pub async fn read_file(
    session: &mut CardSession,
    offset: usize,
    total: usize,
    policy: &ReadPolicy,
) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(total);
    let mut position = offset;

    log::debug!("Reading {total} bytes at offset {offset:#06X}");

    while data.len() < total {
        let remaining = total - data.len();
        let chunk_len = remaining.min(MAX_CHUNK);
        let command = ApduCommand::read_binary(position, chunk_len as u16)?;

        match exchange(session, &command, &policy.success).await {
            Ok(chunk) if chunk.is_empty() => {
                log::warn!(
                    "Card returned no data at offset {position:#06X}, stopping after {} of {total} bytes",
                    data.len()
                );
                break;
            }
            Ok(chunk) => {
                position += chunk.len();
                data.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
            }
            Err(CardError::CardStatus { status })
                if !data.is_empty()
                    && policy.classify(status) == StatusOutcome::RecoverableTruncation =>
            {
                log::warn!(
                    "Card signalled end of file ({status}) after {} of {total} bytes",
                    data.len()
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(data)
}

/// Total size of a DER-encoded record (tag + length header + value) from
/// its first bytes.
pub fn decode_tlv_length(header: &[u8]) -> Result<usize> {
    let length_byte = *header
        .get(1)
        .ok_or_else(|| CardError::Decode("TLV header shorter than 2 bytes".to_string()))?;

    if length_byte & 0x80 == 0 {
        return Ok(2 + length_byte as usize);
    }

    let count = (length_byte & 0x7F) as usize;
    if count == 0 {
        return Err(CardError::Decode(
            "Indefinite TLV length is not supported".to_string(),
        ));
    }
    if count > std::mem::size_of::<u64>() {
        return Err(CardError::Decode(format!(
            "TLV length uses {count} bytes, at most 8 are supported"
        )));
    }

    let length_bytes = header.get(2..2 + count).ok_or_else(|| {
        CardError::Decode(format!(
            "TLV header announces {count} length bytes but only {} are present",
            header.len().saturating_sub(2)
        ))
    })?;

    let value = length_bytes
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64);

    usize::try_from(value)
        .ok()
        .and_then(|v| v.checked_add(2 + count))
        .ok_or_else(|| CardError::Decode(format!("TLV length {value} overflows")))
}
