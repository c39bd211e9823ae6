//! ISO 7816-4 command/response handling.
//!
//! Every command sent to a card goes through [`exchange`], which splits the
//! status word from the payload, rejects statuses the caller did not declare
//! acceptable and yields to the scheduler before handing the payload back.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{CardError, Result};
use crate::core::transport::CardSession;
use crate::core::utils::{describe_status_word, format_hex, parse_hex};

/// Largest response a short APDU can produce: 256 data bytes + SW1 SW2
pub const MAX_RESPONSE_LEN: usize = 258;

/// Largest offset READ BINARY can address (P1 bit 8 selects SFI mode)
pub const MAX_READ_OFFSET: usize = 0x7FFF;

/// A command APDU (short form)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    /// Expected response length, 1..=256. 256 is encoded as 0x00.
    pub le: Option<u16>,
}

impl ApduCommand {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_le(mut self, le: u16) -> Self {
        self.le = Some(le);
        self
    }

    /// READ BINARY at an absolute offset of the currently selected EF
    pub fn read_binary(offset: usize, le: u16) -> Result<Self> {
        if offset > MAX_READ_OFFSET {
            return Err(CardError::OffsetOutOfRange(offset));
        }
        let [p1, p2] = (offset as u16).to_be_bytes();
        Ok(Self::new(0x00, 0xB0, p1, p2).with_le(le))
    }

    /// Parse a short command APDU from its wire form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let malformed =
            || CardError::MalformedResponse(format!("Invalid command APDU: {}", format_hex(bytes)));

        if bytes.len() < 4 {
            return Err(malformed());
        }
        let (header, body) = bytes.split_at(4);
        let mut command = Self::new(header[0], header[1], header[2], header[3]);

        match body {
            [] => {}
            [le] => command.le = Some(decode_le(*le)),
            [lc, rest @ ..] => {
                let lc = *lc as usize;
                if lc == 0 || rest.len() < lc || rest.len() > lc + 1 {
                    return Err(malformed());
                }
                command = command.with_data(&rest[..lc]);
                if let Some(le) = rest.get(lc) {
                    command.le = Some(decode_le(*le));
                }
            }
        }

        Ok(command)
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(6 + self.data.len());
        bytes.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);

        if !self.data.is_empty() {
            bytes.push(self.data.len() as u8);
            bytes.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            bytes.push(if le >= 256 { 0x00 } else { le as u8 });
        }

        bytes
    }
}

fn decode_le(byte: u8) -> u16 {
    if byte == 0 {
        256
    } else {
        byte as u16
    }
}

/// SW1 SW2 as a single big-endian value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord(0x9000);
    pub const END_OF_FILE: StatusWord = StatusWord(0x6282);
    pub const WRONG_OFFSET: StatusWord = StatusWord(0x6B00);

    pub fn from_bytes(sw1: u8, sw2: u8) -> Self {
        Self(u16::from_be_bytes([sw1, sw2]))
    }

    pub fn sw1(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn sw2(self) -> u8 {
        self.0 as u8
    }

    pub fn describe(self) -> String {
        describe_status_word(self.sw1(), self.sw2())
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for StatusWord {
    type Err = CardError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = parse_hex(s).map_err(|e| CardError::Config(format!("{e:#}")))?;
        match bytes.as_slice() {
            [sw1, sw2] => Ok(Self::from_bytes(*sw1, *sw2)),
            _ => Err(CardError::Config(format!(
                "Status word must be exactly 2 bytes: '{s}'"
            ))),
        }
    }
}

impl TryFrom<String> for StatusWord {
    type Error = CardError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StatusWord> for String {
    fn from(status: StatusWord) -> Self {
        status.to_string()
    }
}

/// Response APDU with the status word already split off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub payload: Vec<u8>,
    pub status: StatusWord,
}

impl ApduResponse {
    pub fn parse(mut raw: Vec<u8>) -> Result<Self> {
        if raw.len() < 2 {
            return Err(CardError::MalformedResponse(format!(
                "Response too short: {}",
                format_hex(&raw)
            )));
        }
        let sw2 = raw.pop().unwrap_or_default();
        let sw1 = raw.pop().unwrap_or_default();

        Ok(Self {
            payload: raw,
            status: StatusWord::from_bytes(sw1, sw2),
        })
    }
}

/// One APDU round trip, kept for tracing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub response: String,
    pub status: Option<StatusWord>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Send `command` and return the response payload.
///
/// Fails with `CardError::CardStatus` unless the status word is one of
/// `accepted`. After a successful exchange the task yields once before
/// returning: PCSC drivers have been seen to corrupt a response when the next
/// command is issued immediately after the previous one completes.
pub async fn exchange(
    session: &mut CardSession,
    command: &ApduCommand,
    accepted: &[StatusWord],
) -> Result<Vec<u8>> {
    let bytes = command.to_bytes();
    let timestamp = Utc::now();
    let start_time = Instant::now();

    log::debug!("Transmitting APDU: {}", format_hex(&bytes));

    let result = session.channel_mut().transmit(&bytes, MAX_RESPONSE_LEN);
    let duration_ms = start_time.elapsed().as_millis() as u64;

    let raw = match result {
        Ok(raw) => raw,
        Err(e) => {
            log::error!("Transmit failed: {e}");
            session.record(ExchangeRecord {
                timestamp,
                command: format_hex(&bytes),
                response: String::new(),
                status: None,
                success: false,
                error: Some(e.to_string()),
                duration_ms,
            });
            return Err(e.into());
        }
    };

    log::debug!("Received response: {}", format_hex(&raw));

    let raw_hex = format_hex(&raw);
    let response = match ApduResponse::parse(raw) {
        Ok(response) => response,
        Err(e) => {
            session.record(ExchangeRecord {
                timestamp,
                command: format_hex(&bytes),
                response: raw_hex,
                status: None,
                success: false,
                error: Some(e.to_string()),
                duration_ms,
            });
            return Err(e);
        }
    };

    let success = accepted.contains(&response.status);
    session.record(ExchangeRecord {
        timestamp,
        command: format_hex(&bytes),
        response: raw_hex,
        status: Some(response.status),
        success,
        error: None,
        duration_ms,
    });

    if !success {
        return Err(CardError::CardStatus {
            status: response.status,
        });
    }

    tokio::task::yield_now().await;

    Ok(response.payload)
}
