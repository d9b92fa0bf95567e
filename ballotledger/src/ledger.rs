//! Receipts and the append-only ballot hash chain.
//!
//! ```text
//! receipt    = SHA-256(ciphertext || tag)
//! curr_hash  = SHA-256(prev_hash || receipt || nonce)
//! prev_hash1 = 00 * 32
//! ```
//!
//! The nonce is stored with every ballot, so the whole chain can be recomputed from
//! persisted material. Nothing that identifies a voter is ever hashed into the chain.

use crate::*;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

pub const HASH_LEN: usize = 32;

/// `prev_hash` of the first link
pub const GENESIS_HASH: [u8; HASH_LEN] = [0u8; HASH_LEN];

/// Verification reports at most this many breaks. The true total is always reported.
pub const MAX_REPORTED_BREAKS: usize = 20;

/// SHA-256 over the exact ciphertext bytes, tag included
pub fn receipt(ciphertext: &[u8]) -> [u8; HASH_LEN] {
    Sha256::digest(ciphertext).into()
}

pub fn receipt_hex(ciphertext: &[u8]) -> String {
    hex::encode(receipt(ciphertext))
}

/// Compute the next chain hash from the previous one
pub fn append(prev_hash: &[u8; HASH_LEN], receipt: &[u8], aux: Option<&[u8]>) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(receipt);
    if let Some(aux) = aux {
        hasher.update(aux);
    }
    hasher.finalize().into()
}

/// One link of the chain, as stored.
///
/// Hash and timestamp fields are optional because verification has to cope with
/// whatever is actually in storage, including damaged rows.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChainLink {
    pub id: u64,
    pub ballot_id: BallotId,

    #[serde(with = "optional_hex", default)]
    pub prev_hash: Option<Vec<u8>>,

    #[serde(with = "optional_hex", default)]
    pub curr_hash: Option<Vec<u8>>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ChainLink {
    pub fn new(
        id: u64,
        ballot_id: BallotId,
        prev_hash: [u8; HASH_LEN],
        curr_hash: [u8; HASH_LEN],
        created_at: DateTime<Utc>,
    ) -> Self {
        ChainLink {
            id,
            ballot_id,
            prev_hash: Some(prev_hash.to_vec()),
            curr_hash: Some(curr_hash.to_vec()),
            created_at: Some(created_at),
        }
    }

    /// `curr_hash` as a fixed array, if present and well formed
    pub fn curr_hash_array(&self) -> Option<[u8; HASH_LEN]> {
        to_hash(self.curr_hash.as_deref())
    }

    pub fn prev_hash_array(&self) -> Option<[u8; HASH_LEN]> {
        to_hash(self.prev_hash.as_deref())
    }
}

fn to_hash(bytes: Option<&[u8]>) -> Option<[u8; HASH_LEN]> {
    match bytes {
        Some(b) if b.len() == HASH_LEN => {
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(b);
            Some(hash)
        }
        _ => None,
    }
}

/// The head of the chain
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChainTip {
    pub height: u64,

    /// All zeros for an empty chain
    pub tip_hash: String,

    pub ballot_id: Option<BallotId>,
}

impl ChainTip {
    pub fn empty() -> Self {
        ChainTip {
            height: 0,
            tip_hash: hex::encode(GENESIS_HASH),
            ballot_id: None,
        }
    }

    /// Tip at `link`. A missing or malformed `curr_hash` is `Error::Corrupt`, since
    /// nothing can be appended after it.
    pub fn from_link(height: u64, link: &ChainLink) -> Result<Self> {
        let tip_hash = link.curr_hash_array().ok_or_else(|| {
            Error::Corrupt(format!("chain tip link {} has no valid curr_hash", link.id))
        })?;
        Ok(ChainTip {
            height,
            tip_hash: hex::encode(tip_hash),
            ballot_id: Some(link.ballot_id),
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HashField {
    PrevHash,
    CurrHash,
}

impl std::fmt::Display for HashField {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            HashField::PrevHash => write!(f, "prev_hash"),
            HashField::CurrHash => write!(f, "curr_hash"),
        }
    }
}

/// Why a link failed verification
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakReason {
    /// The first link does not start from the all-zero genesis hash
    GenesisMismatch { actual: String },
    PrevHashMismatch { expected: String, actual: String },
    MissingHash { field: HashField },
    BadHashLength { field: HashField, len: usize },
    MissingTimestamp,
    TimestampRegression,
    IdNotIncreasing { previous: u64 },

    // Only reported by full recomputation
    MissingBallot,
    ReceiptMismatch,
    CurrHashMismatch { expected: String, actual: String },
}

impl std::fmt::Display for BreakReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BreakReason::GenesisMismatch { actual } => {
                write!(f, "first link prev_hash {} is not genesis", actual)
            }
            BreakReason::PrevHashMismatch { expected, actual } => {
                write!(f, "prev_hash {} does not match previous curr_hash {}", actual, expected)
            }
            BreakReason::MissingHash { field } => write!(f, "{} is missing", field),
            BreakReason::BadHashLength { field, len } => {
                write!(f, "{} is {} bytes, expected {}", field, len, HASH_LEN)
            }
            BreakReason::MissingTimestamp => write!(f, "created_at is missing"),
            BreakReason::TimestampRegression => {
                write!(f, "created_at is earlier than the previous link")
            }
            BreakReason::IdNotIncreasing { previous } => {
                write!(f, "id does not increase after {}", previous)
            }
            BreakReason::MissingBallot => write!(f, "referenced ballot does not exist"),
            BreakReason::ReceiptMismatch => {
                write!(f, "ballot receipt does not match its ciphertext")
            }
            BreakReason::CurrHashMismatch { expected, actual } => {
                write!(f, "curr_hash {} does not recompute, expected {}", actual, expected)
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChainBreak {
    pub at_id: u64,
    pub reason: BreakReason,
}

/// Result of verifying a chain
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChainReport {
    pub ok: bool,
    pub height: u64,

    /// The first `MAX_REPORTED_BREAKS` breaks, in chain order
    pub breaks: Vec<ChainBreak>,
    pub total_breaks: usize,

    /// `false` means only link continuity was checked, not that each `curr_hash`
    /// is the hash of its ballot.
    pub full_recompute: bool,
}

struct Breaks {
    reported: Vec<ChainBreak>,
    total: usize,
}

impl Breaks {
    fn new() -> Self {
        Breaks {
            reported: Vec::new(),
            total: 0,
        }
    }

    fn push(&mut self, at_id: u64, reason: BreakReason) {
        self.total += 1;
        if self.reported.len() < MAX_REPORTED_BREAKS {
            self.reported.push(ChainBreak { at_id, reason });
        }
    }

    fn into_report(self, height: usize, full_recompute: bool) -> ChainReport {
        ChainReport {
            ok: self.total == 0,
            height: height as u64,
            breaks: self.reported,
            total_breaks: self.total,
            full_recompute,
        }
    }
}

/// Structural verification of a chain given in ascending id order.
///
/// Checks genesis, prev/curr linkage, hash field presence and length, id order and
/// timestamp order. Does not recompute `curr_hash`; see `verify_chain_with_ballots`.
pub fn verify_chain(links: &[ChainLink]) -> ChainReport {
    let mut breaks = Breaks::new();
    walk_chain(links, &mut breaks, |_, _| {});
    breaks.into_report(links.len(), false)
}

/// Structural verification plus recomputation of every receipt and `curr_hash` from
/// the stored ballots.
pub fn verify_chain_with_ballots<F>(links: &[ChainLink], mut lookup: F) -> ChainReport
where
    F: FnMut(BallotId) -> Option<BallotRecord>,
{
    let mut breaks = Breaks::new();
    walk_chain(links, &mut breaks, |link, breaks| {
        let ballot = match lookup(link.ballot_id) {
            Some(ballot) => ballot,
            None => {
                breaks.push(link.id, BreakReason::MissingBallot);
                return;
            }
        };

        let receipt = receipt(&ballot.ciphertext);
        if hex::encode(receipt) != ballot.receipt_hash {
            breaks.push(link.id, BreakReason::ReceiptMismatch);
        }

        // Missing or malformed hash fields were already reported by the walk
        let (prev, curr) = match (link.prev_hash_array(), link.curr_hash_array()) {
            (Some(prev), Some(curr)) => (prev, curr),
            _ => return,
        };
        let expected = append(&prev, &receipt, Some(ballot.nonce.as_slice()));
        if expected != curr {
            breaks.push(
                link.id,
                BreakReason::CurrHashMismatch {
                    expected: hex::encode(expected),
                    actual: hex::encode(curr),
                },
            );
        }
    });
    breaks.into_report(links.len(), true)
}

// Visit links in order, running the structural checks and then `per_link` on each,
// so reported breaks come out in chain order.
fn walk_chain<F>(links: &[ChainLink], breaks: &mut Breaks, mut per_link: F)
where
    F: FnMut(&ChainLink, &mut Breaks),
{
    let mut previous: Option<&ChainLink> = None;
    let mut last_time: Option<DateTime<Utc>> = None;

    for link in links {
        check_hash_field(link.id, HashField::PrevHash, &link.prev_hash, breaks);
        check_hash_field(link.id, HashField::CurrHash, &link.curr_hash, breaks);

        match previous {
            None => {
                if let Some(prev) = link.prev_hash_array() {
                    if prev != GENESIS_HASH {
                        breaks.push(
                            link.id,
                            BreakReason::GenesisMismatch {
                                actual: hex::encode(prev),
                            },
                        );
                    }
                }
            }
            Some(before) => {
                if link.id <= before.id {
                    breaks.push(
                        link.id,
                        BreakReason::IdNotIncreasing {
                            previous: before.id,
                        },
                    );
                }

                // Only comparable when both sides are well formed
                if let (Some(expected), Some(actual)) =
                    (before.curr_hash_array(), link.prev_hash_array())
                {
                    if expected != actual {
                        breaks.push(
                            link.id,
                            BreakReason::PrevHashMismatch {
                                expected: hex::encode(expected),
                                actual: hex::encode(actual),
                            },
                        );
                    }
                }
            }
        }

        match link.created_at {
            None => breaks.push(link.id, BreakReason::MissingTimestamp),
            Some(created_at) => {
                if let Some(last) = last_time {
                    if created_at < last {
                        breaks.push(link.id, BreakReason::TimestampRegression);
                    }
                }
                last_time = Some(created_at);
            }
        }

        per_link(link, breaks);
        previous = Some(link);
    }
}

fn check_hash_field(id: u64, field: HashField, value: &Option<Vec<u8>>, breaks: &mut Breaks) {
    match value {
        None => breaks.push(id, BreakReason::MissingHash { field }),
        Some(bytes) if bytes.len() != HASH_LEN => breaks.push(
            id,
            BreakReason::BadHashLength {
                field,
                len: bytes.len(),
            },
        ),
        Some(_) => {}
    }
}
