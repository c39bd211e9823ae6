//! Card doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use pcsc::Protocol;

use crate::core::transport::CardChannel;

/// Commands seen by a fake channel, shared with the test after the channel
/// has been boxed into a session
pub type SentLog = Arc<Mutex<Vec<Vec<u8>>>>;

/// Replays canned responses in order
pub struct ScriptedChannel {
    responses: VecDeque<Result<Vec<u8>, pcsc::Error>>,
    sent: SentLog,
    disconnect_error: Option<pcsc::Error>,
}

impl ScriptedChannel {
    pub fn new(responses: Vec<Result<Vec<u8>, pcsc::Error>>) -> Self {
        Self {
            responses: responses.into(),
            sent: SentLog::default(),
            disconnect_error: None,
        }
    }

    pub fn with_disconnect_error(mut self, error: pcsc::Error) -> Self {
        self.disconnect_error = Some(error);
        self
    }

    pub fn sent(&self) -> SentLog {
        Arc::clone(&self.sent)
    }
}

impl CardChannel for ScriptedChannel {
    fn protocol(&self) -> Option<Protocol> {
        Some(Protocol::T1)
    }

    fn transmit(
        &mut self,
        command: &[u8],
        _max_response_len: usize,
    ) -> Result<Vec<u8>, pcsc::Error> {
        self.sent.lock().unwrap().push(command.to_vec());
        self.responses
            .pop_front()
            .unwrap_or(Err(pcsc::Error::RemovedCard))
    }

    fn disconnect(self: Box<Self>) -> Result<(), pcsc::Error> {
        match self.disconnect_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Serves READ BINARY from an in-memory EF; every other command succeeds
pub struct FileCard {
    file: Vec<u8>,
    sent: SentLog,
}

impl FileCard {
    pub fn new(file: Vec<u8>) -> Self {
        Self {
            file,
            sent: SentLog::default(),
        }
    }

    pub fn sent(&self) -> SentLog {
        Arc::clone(&self.sent)
    }
}

impl CardChannel for FileCard {
    fn protocol(&self) -> Option<Protocol> {
        Some(Protocol::T1)
    }

    fn transmit(
        &mut self,
        command: &[u8],
        _max_response_len: usize,
    ) -> Result<Vec<u8>, pcsc::Error> {
        self.sent.lock().unwrap().push(command.to_vec());

        match command {
            [0x00, 0xB0, p1, p2, le] => {
                let wanted = if *le == 0 { 256 } else { *le as usize };
                // SFI addressing reads from the start of the file
                let offset = if p1 & 0x80 != 0 {
                    0
                } else {
                    u16::from_be_bytes([*p1, *p2]) as usize
                };
                if offset >= self.file.len() {
                    return Ok(vec![0x6B, 0x00]);
                }
                let end = (offset + wanted).min(self.file.len());
                let mut response = self.file[offset..end].to_vec();
                if end - offset < wanted && *le != 0 {
                    response.extend_from_slice(&[0x62, 0x82]);
                } else {
                    response.extend_from_slice(&[0x90, 0x00]);
                }
                Ok(response)
            }
            _ => Ok(vec![0x90, 0x00]),
        }
    }

    fn disconnect(self: Box<Self>) -> Result<(), pcsc::Error> {
        Ok(())
    }
}
