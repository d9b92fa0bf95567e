use crate::*;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

pub type BallotId = u64;

/// Matches the width of the election id column.
pub const MAX_ELECTION_ID_LEN: usize = 64;

/// An encrypted, receipted ballot. Immutable once stored.
///
/// No voter reference is kept here, so a stored ballot cannot be linked back to the
/// token that authorised it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BallotRecord {
    pub id: BallotId,
    pub election_id: String,

    /// AES-256-GCM ciphertext with the 16-byte tag appended
    #[serde(with = "hex_serde")]
    pub ciphertext: Vec<u8>,

    #[serde(with = "hex_serde")]
    pub nonce: Vec<u8>,

    /// SHA-256 of `ciphertext`, hex
    pub receipt_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A ballot that has been sealed but not yet committed
#[derive(Debug, Clone, PartialEq)]
pub struct NewBallot {
    pub election_id: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub receipt_hash: String,
}

impl NewBallot {
    pub fn into_record(self, id: BallotId, created_at: DateTime<Utc>) -> BallotRecord {
        BallotRecord {
            id,
            election_id: self.election_id,
            ciphertext: self.ciphertext,
            nonce: self.nonce,
            receipt_hash: self.receipt_hash,
            created_at,
        }
    }
}

/// Check a ranked preference list.
///
/// A valid list is non-empty, has no duplicates, and covers `1..=N` exactly, where N is
/// its length.
pub fn validate_preferences(preferences: &[u32]) -> Result<()> {
    if preferences.is_empty() {
        return Err(Error::InvalidPreferences("empty preference list".to_owned()));
    }

    let mut seen = HashSet::with_capacity(preferences.len());
    for candidate in preferences {
        if *candidate == 0 {
            return Err(Error::InvalidPreferences(
                "candidate ids must be positive".to_owned(),
            ));
        }
        if !seen.insert(*candidate) {
            return Err(Error::DuplicatePreference(*candidate));
        }
    }

    let n = preferences.len() as u32;
    if let Some(out_of_range) = preferences.iter().find(|c| **c > n) {
        return Err(Error::InvalidPreferences(format!(
            "candidate {} is outside 1..={}",
            out_of_range, n
        )));
    }

    Ok(())
}

pub fn validate_election_id(election_id: &str) -> Result<()> {
    let trimmed = election_id.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidElectionId("election id is required".to_owned()));
    }
    if trimmed != election_id {
        return Err(Error::InvalidElectionId(
            "election id has surrounding whitespace".to_owned(),
        ));
    }
    if election_id.len() > MAX_ELECTION_ID_LEN {
        return Err(Error::InvalidElectionId(format!(
            "election id longer than {} bytes",
            MAX_ELECTION_ID_LEN
        )));
    }
    Ok(())
}
