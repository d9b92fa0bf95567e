use crate::*;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::sync::Arc;

/// Returned to a voter on a successful submission
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubmissionReceipt {
    pub ballot_id: BallotId,

    /// SHA-256 of the ciphertext, hex
    pub receipt: String,

    /// `curr_hash` of the link this ballot was appended as, hex
    pub chain_head: String,
}

/// Public information about a receipted ballot. Never includes plaintext.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReceiptInfo {
    pub receipt: String,
    pub election_id: String,
    pub created_at: DateTime<Utc>,
    pub ciphertext_bytes: usize,
    pub nonce_hex: String,
}

/// The ballot pipeline: validate, canonicalize, encrypt, receipt, chain.
pub struct BallotBox<S> {
    store: S,
    keys: Arc<KeyManager>,
    token_ttl: Duration,
}

impl<S: BallotStore + TokenStore> BallotBox<S> {
    pub fn new(store: S, keys: Arc<KeyManager>) -> Self {
        BallotBox {
            store,
            keys,
            token_ttl: Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
        }
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn from_config(config: &Config, store: S, keys: Arc<KeyManager>) -> Self {
        BallotBox::new(store, keys).with_token_ttl(config.token_ttl)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Issue a one-time token for an already-verified voter
    pub fn issue_token(&self, voter_ref: &str) -> Result<OneTimeBallotToken> {
        let token = OneTimeBallotToken::issue(voter_ref, self.token_ttl, Utc::now());
        self.store.put_token(token.clone())?;
        Ok(token)
    }

    pub fn purge_expired_tokens(&self) -> Result<usize> {
        let removed = self.store.delete_expired_tokens(Utc::now())?;
        if removed > 0 {
            debug!("purged {} expired ballot tokens", removed);
        }
        Ok(removed)
    }

    pub fn submit(
        &self,
        token: Option<&str>,
        election_id: &str,
        preferences: &[u32],
    ) -> Result<SubmissionReceipt> {
        self.submit_at(token, election_id, preferences, Utc::now())
    }

    /// Submit a ballot.
    ///
    /// The token is consumed in the same commit that stores the ballot and appends its
    /// link. If the chain tip moves underneath us the append is retried once against
    /// the new tip.
    pub fn submit_at(
        &self,
        token: Option<&str>,
        election_id: &str,
        preferences: &[u32],
        now: DateTime<Utc>,
    ) -> Result<SubmissionReceipt> {
        let token = match token.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(TokenRejection::Missing.into()),
        };

        validate_election_id(election_id)?;
        validate_preferences(preferences)?;

        // Fail early on a bad token. The commit checks it again atomically.
        self.store
            .get_token(token)?
            .ok_or(TokenRejection::Unknown)?
            .check(now)?;

        let timestamp = now.to_rfc3339_opts(SecondsFormat::Micros, true);
        let canonical = zeroize::Zeroizing::new(canonicalize(preferences, election_id, &timestamp));
        let sealed = BallotCipher::new(self.keys.get_or_create_active_key()?).encrypt(&canonical)?;
        let receipt = receipt(&sealed.ciphertext);

        let ballot = NewBallot {
            election_id: election_id.to_owned(),
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce.to_vec(),
            receipt_hash: hex::encode(receipt),
        };

        let mut retried = false;
        loop {
            let expected_prev = tip_hash_bytes(&self.store.chain_tip()?)?;
            let curr_hash = append(&expected_prev, &receipt, Some(&sealed.nonce[..]));

            let submission = PendingSubmission {
                token: token.to_owned(),
                expected_prev,
                curr_hash,
                ballot: ballot.clone(),
                now,
            };

            match self.store.commit_submission(submission) {
                Ok((record, link)) => {
                    let chain_head = hex::encode(curr_hash);
                    info!(
                        "accepted ballot {} for election {} as link {} (head {})",
                        record.id,
                        record.election_id,
                        link.id,
                        &chain_head[..12]
                    );
                    return Ok(SubmissionReceipt {
                        ballot_id: record.id,
                        receipt: record.receipt_hash,
                        chain_head,
                    });
                }
                Err(Error::ChainContinuity { .. }) if !retried => {
                    warn!("chain tip moved during submission, retrying against new tip");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn tip(&self) -> Result<ChainTip> {
        self.store.chain_tip()
    }

    /// Full verification: continuity plus recomputation of every receipt and hash
    pub fn verify(&self) -> Result<ChainReport> {
        let chain = self.store.chain()?;
        let mut lookup_error = None;

        let report = verify_chain_with_ballots(&chain, |id| match self.store.get_ballot(id) {
            Ok(ballot) => ballot,
            Err(e) => {
                lookup_error.get_or_insert(e);
                None
            }
        });
        if let Some(e) = lookup_error {
            return Err(e);
        }

        if !report.ok {
            error!(
                "chain verification found {} breaks, first at link {}",
                report.total_breaks,
                report.breaks.first().map_or(0, |b| b.at_id)
            );
        }
        Ok(report)
    }

    /// Continuity-only verification. Does not read any ballot.
    pub fn verify_structure(&self) -> Result<ChainReport> {
        Ok(verify_chain(&self.store.chain()?))
    }

    pub fn lookup_receipt(&self, receipt_hex: &str) -> Result<ReceiptInfo> {
        let receipt_hex = receipt_hex.trim().to_lowercase();
        if receipt_hex.len() != HASH_LEN * 2 || hex::decode(&receipt_hex).is_err() {
            return Err(Error::InvalidReceipt(receipt_hex));
        }

        let ballot = self
            .store
            .find_by_receipt(&receipt_hex)?
            .ok_or_else(|| Error::not_found("receipt", &receipt_hex))?;

        Ok(ReceiptInfo {
            receipt: ballot.receipt_hash,
            election_id: ballot.election_id,
            created_at: ballot.created_at,
            ciphertext_bytes: ballot.ciphertext.len(),
            nonce_hex: hex::encode(&ballot.nonce),
        })
    }

    /// Audit path: decrypt a stored ballot back to its canonical bytes
    pub fn decrypt_ballot(&self, id: BallotId) -> Result<Vec<u8>> {
        let ballot = self
            .store
            .get_ballot(id)?
            .ok_or_else(|| Error::not_found("ballot", id))?;

        let cipher = BallotCipher::new(self.keys.get_or_create_active_key()?);
        cipher.decrypt(&ballot.ciphertext, &ballot.nonce).map_err(|e| {
            error!("ballot {} failed authentication", id);
            e
        })
    }

    pub fn results_bundle(&self) -> Result<ResultsBundle> {
        ResultsBundle::build(&self.store, Utc::now())
    }
}

fn tip_hash_bytes(tip: &ChainTip) -> Result<[u8; HASH_LEN]> {
    let bytes = hex::decode(&tip.tip_hash)
        .map_err(|_| Error::Corrupt(format!("chain tip {} is not hex", tip.tip_hash)))?;
    if bytes.len() != HASH_LEN {
        return Err(Error::Corrupt(format!(
            "chain tip is {} bytes, expected {}",
            bytes.len(),
            HASH_LEN
        )));
    }
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ballot_box() -> BallotBox<Arc<MemStore>> {
        let keys = Arc::new(KeyManager::new(Kek::generate(), "default-key"));
        BallotBox::new(Arc::new(MemStore::new()), keys)
    }

    #[test]
    fn test_submit_and_lookup() {
        let bb = ballot_box();
        let token = bb.issue_token("voter-ref-1").unwrap();

        let receipt = bb.submit(Some(token.token.as_str()), "E1", &[2, 1, 3]).unwrap();
        assert_eq!(receipt.ballot_id, 1);
        assert_eq!(receipt.receipt.len(), 64);
        assert_eq!(receipt.chain_head, bb.tip().unwrap().tip_hash);

        let info = bb.lookup_receipt(&receipt.receipt.to_uppercase()).unwrap();
        assert_eq!(info.election_id, "E1");
        assert_eq!(info.nonce_hex.len(), NONCE_LEN * 2);

        let plaintext = bb.decrypt_ballot(receipt.ballot_id).unwrap();
        let text = String::from_utf8(plaintext).unwrap();
        assert!(text.starts_with(r#"{"e":"E1","t":""#));
        assert!(text.ends_with(r#"Z","p":[2,1,3]}"#));

        assert!(bb.verify().unwrap().ok);
    }

    #[test]
    fn test_rejected_submissions_leave_no_trace() {
        let bb = ballot_box();
        let token = bb.issue_token("voter-ref-1").unwrap();

        assert!(matches!(
            bb.submit(None, "E1", &[1]),
            Err(Error::Token(TokenRejection::Missing))
        ));
        assert!(matches!(
            bb.submit(Some("deadbeef"), "E1", &[1]),
            Err(Error::Token(TokenRejection::Unknown))
        ));
        assert!(matches!(
            bb.submit(Some(token.token.as_str()), "E1", &[1, 1]),
            Err(Error::DuplicatePreference(1))
        ));
        assert!(matches!(
            bb.submit(Some(token.token.as_str()), "", &[1]),
            Err(Error::InvalidElectionId(_))
        ));

        let late = Utc::now() + Duration::seconds(DEFAULT_TOKEN_TTL_SECS + 1);
        assert!(matches!(
            bb.submit_at(Some(token.token.as_str()), "E1", &[1], late),
            Err(Error::Token(TokenRejection::Expired))
        ));

        assert_eq!(bb.tip().unwrap(), ChainTip::empty());
        assert!(bb.store().ballots().unwrap().is_empty());

        // The token survived all of that and still works exactly once
        bb.submit(Some(token.token.as_str()), "E1", &[1]).unwrap();
        assert!(matches!(
            bb.submit(Some(token.token.as_str()), "E1", &[1]),
            Err(Error::Token(TokenRejection::AlreadyUsed))
        ));
        assert_eq!(bb.tip().unwrap().height, 1);
    }

    #[test]
    fn test_receipt_lookup_errors() {
        let bb = ballot_box();
        assert!(matches!(
            bb.lookup_receipt("abc"),
            Err(Error::InvalidReceipt(_))
        ));
        assert!(matches!(
            bb.lookup_receipt(&"ab".repeat(32)),
            Err(Error::NotFound { kind: "receipt", .. })
        ));
        assert!(matches!(
            bb.decrypt_ballot(9),
            Err(Error::NotFound { kind: "ballot", .. })
        ));
    }

    #[test]
    fn test_purge_expired_tokens() {
        let bb = ballot_box().with_token_ttl(Duration::seconds(-1));
        bb.issue_token("a").unwrap();
        bb.issue_token("b").unwrap();
        assert_eq!(bb.purge_expired_tokens().unwrap(), 2);
    }
}
