/// Health Card Reader - reads insurant data from German eGK and Austrian
/// e-card health insurance cards
///
/// This library provides the card protocol engine (APDU exchange, chunked
/// file reads, per-family decode pipelines and the reader session state
/// machine) together with the command line front end.
pub mod cli;
pub mod core;

// Re-export commonly used types
pub use core::{
    card::read_insurant,
    config::Config,
    error::{CardError, Result},
    family::{AtrTable, CardFamily},
    reader::{PcscReader, ReaderInfo, ReaderMonitor},
    record::InsurantRecord,
    session::{Notification, ReaderEvent, SessionManager, SessionState},
    transport::{CardChannel, CardConnector, CardSession},
};
