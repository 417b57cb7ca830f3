//! The set of connection IDs the peer has issued to us.
//!
//! Records are kept ordered by sequence number. Retirement advances a watermark; every record
//! below it is queued for a RETIRE_CONNECTION_ID frame and dropped. The preferred outgoing
//! destination CID is always the highest sequence seen.

use constant_time_eq::constant_time_eq;

use packet::ConnectionId;
use {TransportError, RESET_TOKEN_SIZE};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CidEntry {
    pub sequence: u64,
    pub id: ConnectionId,
    pub reset_token: [u8; RESET_TOKEN_SIZE],
}

/// Result of admitting a NEW_CONNECTION_ID frame
#[derive(Debug, Eq, PartialEq)]
pub struct CidUpdate {
    /// Sequence numbers to acknowledge with RETIRE_CONNECTION_ID frames
    pub retired: Vec<u64>,
    /// New preferred destination CID, if the frame introduced a higher sequence
    pub preferred: Option<ConnectionId>,
}

pub struct CidMap {
    entries: Vec<CidEntry>,
    /// Lowest sequence number that has not been retired
    retire_watermark: u64,
}

impl CidMap {
    /// Starts with the CID the handshake arrived on, which implicitly has sequence 0 and no
    /// reset token
    pub fn new(handshake_cid: ConnectionId) -> Self {
        CidMap {
            entries: vec![CidEntry {
                sequence: 0,
                id: handshake_cid,
                reset_token: [0; RESET_TOKEN_SIZE],
            }],
            retire_watermark: 0,
        }
    }

    pub fn active(&self) -> usize {
        self.entries.len()
    }

    /// Admit a NEW_CONNECTION_ID frame
    ///
    /// `limit` is our advertised `active_connection_id_limit`; exceeding it is fatal.
    pub fn insert(
        &mut self,
        sequence: u64,
        retire_prior_to: u64,
        id: ConnectionId,
        reset_token: [u8; RESET_TOKEN_SIZE],
        limit: u64,
    ) -> Result<CidUpdate, TransportError> {
        let mut update = CidUpdate {
            retired: Vec::new(),
            preferred: None,
        };
        if sequence < self.retire_watermark {
            // Already retired; acknowledge and drop
            update.retired.push(sequence);
            return Ok(update);
        }
        if let Some(existing) = self.entries.iter().find(|x| x.sequence == sequence) {
            if existing.id != id || !constant_time_eq(&existing.reset_token, &reset_token) {
                return Err(TransportError::PROTOCOL_VIOLATION);
            }
            return Ok(update);
        }
        let highest = self.entries.iter().map(|x| x.sequence).max().unwrap_or(0);
        let pos = self
            .entries
            .iter()
            .position(|x| x.sequence > sequence)
            .unwrap_or_else(|| self.entries.len());
        self.entries.insert(
            pos,
            CidEntry {
                sequence,
                id,
                reset_token,
            },
        );
        if sequence > highest {
            update.preferred = Some(id);
        }
        if retire_prior_to > self.retire_watermark {
            self.retire_watermark = retire_prior_to;
            let watermark = self.retire_watermark;
            let mut i = 0;
            while i < self.entries.len() {
                if self.entries[i].sequence < watermark {
                    update.retired.push(self.entries.remove(i).sequence);
                } else {
                    i += 1;
                }
            }
        }
        if self.entries.len() as u64 > limit {
            return Err(TransportError::CONNECTION_ID_LIMIT_ERROR);
        }
        Ok(update)
    }

    /// Whether `token` matches any issued stateless-reset token, in constant time per entry
    pub fn matches_reset_token(&self, token: &[u8; RESET_TOKEN_SIZE]) -> bool {
        let mut found = false;
        for entry in &self.entries {
            found |= constant_time_eq(&entry.reset_token, token);
        }
        found
    }
}
