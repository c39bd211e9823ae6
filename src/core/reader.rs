use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pcsc::{Card, Context, Disposition, Protocol, Protocols, ReaderState, Scope, ShareMode, State, PNP_NOTIFICATION};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::core::error::Result;
use crate::core::session::ReaderEvent;
use crate::core::transport::{CardChannel, CardConnector, CardSession};

/// Information about a PCSC reader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderInfo {
    pub name: String,
    /// A card is present in the reader
    pub is_connected: bool,
    pub atr: Option<Vec<u8>>,
}

/// PCSC context manager
pub struct PcscReader {
    context: Option<Context>,
}

impl PcscReader {
    /// Establish a user scope PCSC context
    pub fn new() -> Result<Self> {
        let context = Context::establish(Scope::User)?;
        Ok(Self {
            context: Some(context),
        })
    }

    fn context(&self) -> Result<&Context> {
        Ok(self.context.as_ref().ok_or(pcsc::Error::InvalidHandle)?)
    }

    /// List all available readers with their card state
    pub fn list_readers(&self) -> Result<Vec<ReaderInfo>> {
        let context = self.context()?;
        let names = match context.list_readers_owned() {
            Ok(names) => names,
            Err(pcsc::Error::NoReadersAvailable) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut states: Vec<ReaderState> = names
            .into_iter()
            .map(|name| ReaderState::new(name, State::UNAWARE))
            .collect();
        if !states.is_empty() {
            context.get_status_change(Duration::ZERO, &mut states)?;
        }

        Ok(states
            .iter()
            .map(|rs| {
                let present = rs.event_state().contains(State::PRESENT);
                ReaderInfo {
                    name: rs.name().to_string_lossy().into_owned(),
                    is_connected: present,
                    atr: present.then(|| rs.atr().to_vec()),
                }
            })
            .collect())
    }

    /// Connect to the card in `reader` and open a session on it
    pub fn open_session(&self, reader: &str) -> Result<CardSession> {
        log::info!("Connecting to reader: {reader}");

        let channel = PcscChannel::open(self.context()?, reader)?;
        let atr = channel.card.status2_owned()?.atr().to_vec();

        log::info!("Successfully connected to reader: {reader}");
        Ok(CardSession::new(reader, atr, Box::new(channel)))
    }
}

impl CardConnector for PcscReader {
    fn connect(&mut self, reader: &str) -> std::result::Result<Box<dyn CardChannel>, pcsc::Error> {
        let context = self.context.as_ref().ok_or(pcsc::Error::InvalidHandle)?;
        Ok(Box::new(PcscChannel::open(context, reader)?))
    }

    fn close(&mut self) {
        if self.context.take().is_some() {
            log::info!("Released PCSC context");
        }
    }
}

/// Shared-mode connection to a card
pub struct PcscChannel {
    card: Card,
    protocol: Option<Protocol>,
}

impl PcscChannel {
    fn open(context: &Context, reader: &str) -> std::result::Result<Self, pcsc::Error> {
        let name = CString::new(reader).map_err(|_| pcsc::Error::UnknownReader)?;
        let card = context.connect(&name, ShareMode::Shared, Protocols::ANY)?;
        let protocol = card.status2_owned()?.protocol2();
        Ok(Self { card, protocol })
    }
}

impl CardChannel for PcscChannel {
    fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    fn transmit(
        &mut self,
        command: &[u8],
        max_response_len: usize,
    ) -> std::result::Result<Vec<u8>, pcsc::Error> {
        let mut buffer = vec![0u8; max_response_len];
        let response = self.card.transmit(command, &mut buffer)?;
        Ok(response.to_vec())
    }

    fn disconnect(self: Box<Self>) -> std::result::Result<(), pcsc::Error> {
        self.card
            .disconnect(Disposition::LeaveCard)
            .map_err(|(_card, e)| e)
    }
}

/// Background watcher turning PCSC status changes into [`ReaderEvent`]s
pub struct ReaderMonitor {
    context: Context,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReaderMonitor {
    /// Start watching all readers, waking at least every `poll_interval`
    pub fn spawn(poll_interval: Duration) -> Result<(Self, UnboundedReceiver<ReaderEvent>)> {
        let context = Context::establish(Scope::User)?;
        let (events, receiver) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let context = context.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || watch(&context, poll_interval, &stop, &events))
        };

        let monitor = Self {
            context,
            stop,
            handle: Some(handle),
        };
        Ok((monitor, receiver))
    }

    /// Cancel the pending wait and join the watcher thread
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.context.cancel() {
            log::debug!("Cancelling status wait failed: {e}");
        }
        if handle.join().is_err() {
            log::error!("Reader monitor thread panicked");
        }
        log::debug!("Reader monitor stopped");
    }
}

impl Drop for ReaderMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_name(name: &CStr) -> String {
    name.to_string_lossy().into_owned()
}

fn is_dead(rs: &ReaderState) -> bool {
    rs.name() != PNP_NOTIFICATION() && rs.event_state().intersects(State::UNKNOWN | State::IGNORE)
}

fn watch(
    context: &Context,
    poll_interval: Duration,
    stop: &AtomicBool,
    events: &UnboundedSender<ReaderEvent>,
) {
    let send = |event: ReaderEvent| events.send(event).is_ok();
    let mut states = vec![ReaderState::new(PNP_NOTIFICATION(), State::UNAWARE)];

    log::debug!("Reader monitor started");

    while !stop.load(Ordering::SeqCst) {
        for rs in states.iter().filter(|rs| is_dead(rs)) {
            send(ReaderEvent::Detached {
                reader: reader_name(rs.name()),
            });
        }
        states.retain(|rs| !is_dead(rs));

        match context.list_readers_owned() {
            Ok(names) => {
                for name in names {
                    if !states.iter().any(|rs| rs.name() == name.as_c_str()) {
                        send(ReaderEvent::Attached {
                            reader: reader_name(&name),
                        });
                        states.push(ReaderState::new(name, State::UNAWARE));
                    }
                }
            }
            Err(pcsc::Error::NoReadersAvailable) => {}
            Err(e) => log::warn!("Failed to list readers: {e}"),
        }

        for rs in &mut states {
            rs.sync_current_state();
        }

        match context.get_status_change(poll_interval, &mut states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => continue,
            Err(pcsc::Error::Cancelled) => break,
            Err(e) => {
                log::error!("Waiting for reader status failed: {e}");
                for rs in states.iter().filter(|rs| rs.name() != PNP_NOTIFICATION()) {
                    send(ReaderEvent::Failed {
                        reader: reader_name(rs.name()),
                        cause: e.to_string(),
                    });
                }
                break;
            }
        }

        for rs in &states {
            if rs.name() == PNP_NOTIFICATION() || is_dead(rs) {
                continue;
            }
            if rs.event_state().contains(State::CHANGED) {
                let delivered = send(ReaderEvent::StatusChanged {
                    reader: reader_name(rs.name()),
                    state: rs.event_state() - State::CHANGED,
                    atr: rs.atr().to_vec(),
                });
                if !delivered {
                    log::debug!("Event receiver dropped, stopping reader monitor");
                    return;
                }
            }
        }
    }
}
