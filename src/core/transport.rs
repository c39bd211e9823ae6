use pcsc::Protocol;

use crate::core::apdu::ExchangeRecord;
use crate::core::error::{CardError, Result};

/// An open connection to a card, able to move raw APDU bytes
pub trait CardChannel: Send {
    /// Negotiated transport protocol
    fn protocol(&self) -> Option<Protocol>;

    /// Send a command and return the raw response (payload + SW1 SW2)
    fn transmit(&mut self, command: &[u8], max_response_len: usize)
        -> Result<Vec<u8>, pcsc::Error>;

    /// Close the connection, leaving the card in the reader
    fn disconnect(self: Box<Self>) -> Result<(), pcsc::Error>;
}

/// Opens card connections on named readers
#[cfg_attr(test, mockall::automock)]
pub trait CardConnector {
    /// Connect to the card in `reader` in shared mode
    fn connect(&mut self, reader: &str) -> Result<Box<dyn CardChannel>, pcsc::Error>;

    /// Release the underlying PCSC context
    fn close(&mut self);
}

/// A live connection to a card in one reader
///
/// Only valid while the card is present; dropped on removal or reader detach.
pub struct CardSession {
    reader: String,
    protocol: Option<Protocol>,
    atr: Vec<u8>,
    channel: Box<dyn CardChannel>,
    history: Vec<ExchangeRecord>,
}

impl CardSession {
    pub fn new(reader: impl Into<String>, atr: Vec<u8>, channel: Box<dyn CardChannel>) -> Self {
        Self {
            reader: reader.into(),
            protocol: channel.protocol(),
            atr,
            channel,
            history: Vec::new(),
        }
    }

    pub fn reader(&self) -> &str {
        &self.reader
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    pub(crate) fn channel_mut(&mut self) -> &mut dyn CardChannel {
        self.channel.as_mut()
    }

    pub(crate) fn record(&mut self, record: ExchangeRecord) {
        self.history.push(record);
    }

    /// APDUs exchanged on this session, oldest first
    pub fn history(&self) -> &[ExchangeRecord] {
        &self.history
    }

    /// Export the exchange history to JSON
    pub fn export_history(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.history)
            .map_err(|e| CardError::Decode(format!("Failed to serialize exchange history: {e}")))
    }

    /// Disconnect from the card, leaving it in the reader
    pub fn close(self) -> Result<()> {
        log::info!("Disconnecting from card in reader: {}", self.reader);
        self.channel.disconnect()?;
        Ok(())
    }
}

impl std::fmt::Debug for CardSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardSession")
            .field("reader", &self.reader)
            .field("protocol", &self.protocol)
            .field("atr", &self.atr)
            .finish_non_exhaustive()
    }
}
