use thiserror::Error;

use crate::core::apdu::StatusWord;
use crate::core::asn1::Asn1Error;
use crate::core::utils::format_hex_spaced;

/// Errors raised while talking to a health card or decoding its data
#[derive(Debug, Error)]
pub enum CardError {
    /// Reader or driver failure, passed through unchanged
    #[error("Transport error: {0}")]
    Transport(#[from] pcsc::Error),

    /// The card rejected a command
    #[error("Card responded with status {status} ({})", .status.describe())]
    CardStatus { status: StatusWord },

    #[error("Unknown card type, ATR: {}", format_hex_spaced(.atr))]
    UnknownCard { atr: Vec<u8> },

    #[error("Malformed card response: {0}")]
    MalformedResponse(String),

    #[error("File offset {0:#06X} cannot be addressed by READ BINARY")]
    OffsetOutOfRange(usize),

    #[error("No card session on reader '{0}'")]
    NoSession(String),

    #[error("Failed to inflate personal data: {0}")]
    Inflate(#[source] std::io::Error),

    #[error("Invalid personal data XML: {0}")]
    Xml(String),

    #[error("Invalid ASN.1 structure: {0}")]
    Asn1(#[from] Asn1Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CardError {
    /// Status word carried by a `CardStatus` error
    pub fn status(&self) -> Option<StatusWord> {
        match self {
            CardError::CardStatus { status } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T, E = CardError> = std::result::Result<T, E>;
