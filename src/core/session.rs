//! Card session state machine.
//!
//! [`SessionManager`] consumes reader events (from [`crate::core::reader::ReaderMonitor`]
//! or any other source), keeps one [`CardSession`] per reader holding a card and
//! publishes lifecycle [`Notification`]s on a channel.
//!
//! Card insertion and removal are edge detected: only the `PRESENT` / `EMPTY`
//! bits that differ from the previous status of the same reader cause a
//! transition, so a repeated status report is a no-op.

use std::collections::HashMap;

use pcsc::State;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::core::card;
use crate::core::config::Config;
use crate::core::error::{CardError, Result};
use crate::core::record::InsurantRecord;
use crate::core::transport::{CardConnector, CardSession};
use crate::core::utils::format_hex;

/// Input of the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Attached { reader: String },
    Detached { reader: String },
    /// The reader reported an error and is no longer usable
    Failed { reader: String, cause: String },
    StatusChanged {
        reader: String,
        state: State,
        atr: Vec<u8>,
    },
}

/// Output of the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Notification {
    ReaderConnected { reader: String },
    ReaderDisconnected { reader: String },
    CardConnected { reader: String, atr: String },
    CardDisconnected { reader: String },
    Error { reader: Option<String>, cause: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Detached,
    CardAbsent,
    CardConnected,
}

#[derive(Debug)]
struct ReaderSlot {
    last_state: State,
    session: Option<CardSession>,
}

/// Tracks readers and their card sessions
pub struct SessionManager<C: CardConnector> {
    connector: C,
    readers: HashMap<String, ReaderSlot>,
    notifications: UnboundedSender<Notification>,
    closed: bool,
}

impl<C: CardConnector> SessionManager<C> {
    pub fn new(connector: C) -> (Self, UnboundedReceiver<Notification>) {
        let (notifications, receiver) = mpsc::unbounded_channel();
        let manager = Self {
            connector,
            readers: HashMap::new(),
            notifications,
            closed: false,
        };
        (manager, receiver)
    }

    pub fn handle(&mut self, event: ReaderEvent) {
        if self.closed {
            log::debug!("Ignoring event after shutdown: {event:?}");
            return;
        }

        match event {
            ReaderEvent::Attached { reader } => self.attach(&reader),
            ReaderEvent::Detached { reader } => self.detach(&reader),
            ReaderEvent::Failed { reader, cause } => {
                log::error!("Reader {reader} failed: {cause}");
                self.notify(Notification::Error {
                    reader: Some(reader.clone()),
                    cause,
                });
                self.detach(&reader);
            }
            ReaderEvent::StatusChanged { reader, state, atr } => {
                self.status_changed(&reader, state, atr)
            }
        }
    }

    pub fn state(&self, reader: &str) -> SessionState {
        match self.readers.get(reader) {
            None => SessionState::Detached,
            Some(slot) if slot.session.is_some() => SessionState::CardConnected,
            Some(_) => SessionState::CardAbsent,
        }
    }

    pub fn session_mut(&mut self, reader: &str) -> Option<&mut CardSession> {
        self.readers.get_mut(reader)?.session.as_mut()
    }

    /// Read the insurant record from the card connected in `reader`
    pub async fn read_insurant(&mut self, reader: &str, config: &Config) -> Result<InsurantRecord> {
        let session = self
            .session_mut(reader)
            .ok_or_else(|| CardError::NoSession(reader.to_string()))?;
        card::read_insurant(session, config).await
    }

    /// Disconnect every card and release the connector. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for (reader, slot) in self.readers.drain() {
            if let Some(session) = slot.session {
                if let Err(e) = session.close() {
                    log::warn!("Failed to disconnect cleanly from card in {reader}: {e}");
                }
            }
        }
        self.connector.close();
        log::info!("Session manager shut down");
    }

    fn attach(&mut self, reader: &str) {
        if self.readers.contains_key(reader) {
            log::debug!("Reader {reader} already attached");
            return;
        }

        log::info!("Reader attached: {reader}");
        self.readers.insert(
            reader.to_string(),
            ReaderSlot {
                last_state: State::UNAWARE,
                session: None,
            },
        );
        self.notify(Notification::ReaderConnected {
            reader: reader.to_string(),
        });
    }

    fn detach(&mut self, reader: &str) {
        let Some(slot) = self.readers.remove(reader) else {
            log::debug!("Detach for unknown reader {reader}");
            return;
        };

        if let Some(session) = slot.session {
            if let Err(e) = session.close() {
                log::warn!("Failed to disconnect cleanly from card in {reader}: {e}");
            }
        }

        log::info!("Reader detached: {reader}");
        self.notify(Notification::ReaderDisconnected {
            reader: reader.to_string(),
        });
    }

    fn status_changed(&mut self, reader: &str, state: State, atr: Vec<u8>) {
        if !self.readers.contains_key(reader) {
            self.attach(reader);
        }
        let Some(slot) = self.readers.get_mut(reader) else {
            return;
        };

        let changes = slot.last_state ^ state;
        slot.last_state = state;

        if changes.contains(State::EMPTY) && state.contains(State::EMPTY) {
            self.card_removed(reader);
        } else if changes.contains(State::PRESENT) && state.contains(State::PRESENT) {
            self.card_inserted(reader, atr);
        }
    }

    fn card_inserted(&mut self, reader: &str, atr: Vec<u8>) {
        log::info!("Card inserted in {reader}, ATR: {}", format_hex(&atr));

        let channel = match self.connector.connect(reader) {
            Ok(channel) => channel,
            Err(e) => {
                log::error!("Failed to connect to card in {reader}: {e}");
                self.notify(Notification::Error {
                    reader: Some(reader.to_string()),
                    cause: e.to_string(),
                });
                return;
            }
        };

        let session = CardSession::new(reader, atr.clone(), channel);
        log::info!(
            "Connected to card in {reader} using protocol {:?}",
            session.protocol()
        );

        if let Some(slot) = self.readers.get_mut(reader) {
            if let Some(stale) = slot.session.replace(session) {
                log::warn!("Replacing stale session on {reader}");
                if let Err(e) = stale.close() {
                    log::warn!("Failed to disconnect stale session on {reader}: {e}");
                }
            }
        }

        self.notify(Notification::CardConnected {
            reader: reader.to_string(),
            atr: format_hex(&atr),
        });
    }

    fn card_removed(&mut self, reader: &str) {
        let Some(session) = self
            .readers
            .get_mut(reader)
            .and_then(|slot| slot.session.take())
        else {
            log::debug!("Card removed from {reader} without an open session");
            return;
        };

        log::info!("Card removed from {reader}");
        if let Err(e) = session.close() {
            log::warn!("Failed to disconnect cleanly from card in {reader}: {e}");
            self.notify(Notification::Error {
                reader: Some(reader.to_string()),
                cause: e.to_string(),
            });
        }

        self.notify(Notification::CardDisconnected {
            reader: reader.to_string(),
        });
    }

    fn notify(&self, notification: Notification) {
        // A dropped receiver only means nobody is listening any more
        if self.notifications.send(notification).is_err() {
            log::debug!("Notification receiver dropped");
        }
    }
}

impl<C: CardConnector> Drop for SessionManager<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
