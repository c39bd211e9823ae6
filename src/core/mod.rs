pub mod apdu;
pub mod asn1;
pub mod card;
pub mod config;
pub mod ecard;
pub mod egk;
pub mod error;
pub mod family;
pub mod file;
pub mod reader;
pub mod record;
pub mod session;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{CardError, Result};
