use crate::*;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

pub const RESULTS_SCHEMA: &str = "ballotledger.results.v1";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ElectionTotal {
    pub election_id: String,
    pub ballots: u64,
}

/// Publishable per-election ballot counts, pinned to a chain tip.
///
/// This is what gets signed. Counts are of accepted encrypted ballots only; nothing
/// here requires decrypting anything.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResultsBundle {
    pub generated_at: DateTime<Utc>,
    pub schema: String,
    pub chain_height: u64,
    pub chain_tip: String,

    /// Sorted by election id
    pub totals: Vec<ElectionTotal>,
}

impl ResultsBundle {
    pub fn build<S: BallotStore>(store: &S, now: DateTime<Utc>) -> Result<Self> {
        let tip = store.chain_tip()?;

        let mut totals: Vec<ElectionTotal> = store
            .ballot_counts()?
            .into_iter()
            .map(|(election_id, ballots)| ElectionTotal {
                election_id,
                ballots,
            })
            .collect();
        totals.sort_by(|a, b| a.election_id.cmp(&b.election_id));

        Ok(ResultsBundle {
            generated_at: now,
            schema: RESULTS_SCHEMA.to_owned(),
            chain_height: tip.height,
            chain_tip: tip.tip_hash,
            totals,
        })
    }

    pub fn total_ballots(&self) -> u64 {
        self.totals.iter().map(|t| t.ballots).sum()
    }

    /// SHA-256 of the canonical JSON, hex. Doubles as an ETag.
    pub fn checksum(&self) -> Result<String> {
        let bytes = canonical_json(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn submit(store: &MemStore, election_id: &str, n: u8) {
        let now = Utc::now();
        for i in 0..n {
            let token = OneTimeBallotToken::issue("v", Duration::minutes(1), now);
            store.put_token(token.clone()).unwrap();

            let ciphertext = vec![i; 20];
            let receipt = receipt(&ciphertext);
            let prev = hex::decode(store.chain_tip().unwrap().tip_hash).unwrap();
            let mut expected_prev = [0u8; HASH_LEN];
            expected_prev.copy_from_slice(&prev);

            store
                .commit_submission(PendingSubmission {
                    token: token.token,
                    expected_prev,
                    curr_hash: append(&expected_prev, &receipt, None),
                    ballot: NewBallot {
                        election_id: election_id.to_owned(),
                        ciphertext,
                        nonce: vec![0; NONCE_LEN],
                        receipt_hash: hex::encode(receipt),
                    },
                    now,
                })
                .unwrap();
        }
    }

    #[test]
    fn test_build() {
        let store = MemStore::new();
        submit(&store, "E2", 1);
        submit(&store, "E1", 2);

        let now = Utc::now();
        let bundle = ResultsBundle::build(&store, now).unwrap();
        assert_eq!(bundle.schema, RESULTS_SCHEMA);
        assert_eq!(bundle.chain_height, 3);
        assert_eq!(
            bundle.totals,
            vec![
                ElectionTotal {
                    election_id: "E1".to_owned(),
                    ballots: 2
                },
                ElectionTotal {
                    election_id: "E2".to_owned(),
                    ballots: 1
                },
            ]
        );
        assert_eq!(bundle.total_ballots(), 3);

        let checksum = bundle.checksum().unwrap();
        assert_eq!(checksum.len(), 64);
        assert_eq!(checksum, ResultsBundle::build(&store, now).unwrap().checksum().unwrap());
    }

    #[test]
    fn test_empty_store() {
        let bundle = ResultsBundle::build(&MemStore::new(), Utc::now()).unwrap();
        assert!(bundle.totals.is_empty());
        assert_eq!(bundle.chain_tip, ChainTip::empty().tip_hash);
    }
}
