use super::*;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn keys() -> Arc<KeyManager> {
    Arc::new(KeyManager::new(Kek::generate(), "default-key"))
}

#[test]
fn end_to_end_election() {
    let dir = tempfile::tempdir().unwrap();
    let kek = Kek::generate();

    // Process start: config validated eagerly, keys loaded once
    let kek_hex = kek.to_hex();
    let wrapped = dir.path().join("ballotledger.dek");
    let signing = dir.path().join("signing.key");
    let exports = dir.path().join("exports");
    let backups = dir.path().join("backup");
    let config = Config::from_vars(|name| match name {
        ENV_KEK_HEX => Some(kek_hex.to_string()),
        ENV_WRAPPED_KEY_PATH => Some(wrapped.display().to_string()),
        ENV_SIGNING_KEY_PATH => Some(signing.display().to_string()),
        ENV_EXPORT_DIR => Some(exports.display().to_string()),
        ENV_BACKUP_DIR => Some(backups.display().to_string()),
        _ => None,
    })
    .unwrap();

    let store = Arc::new(MemStore::new());
    let keys = Arc::new(KeyManager::from_config(&config));
    let ballot_box = BallotBox::from_config(&config, store.clone(), keys.clone());
    let signing_keys = SigningKeyProvider::load_or_create(&config.signing_key_path).unwrap();
    let signer = ResultsSigner::new(signing_keys);

    // Voting
    let mut receipts = Vec::new();
    for (i, prefs) in [vec![2u32, 1, 3], vec![1, 2, 3], vec![3, 2, 1]].iter().enumerate() {
        let token = ballot_box.issue_token(&format!("ref-{}", i)).unwrap();
        receipts.push(ballot_box.submit(Some(token.token.as_str()), "E1", prefs).unwrap());
    }
    let token = ballot_box.issue_token("ref-e2").unwrap();
    ballot_box.submit(Some(token.token.as_str()), "E2", &[1]).unwrap();

    // Chain
    let tip = ballot_box.tip().unwrap();
    assert_eq!(tip.height, 4);
    assert_eq!(tip.ballot_id, Some(4));
    let chain = store.chain().unwrap();
    assert_eq!(chain[0].prev_hash.as_deref(), Some(&GENESIS_HASH[..]));
    assert_eq!(hex::encode(chain[2].curr_hash.as_ref().unwrap()), receipts[2].chain_head);

    let report = ballot_box.verify().unwrap();
    assert!(report.ok);
    assert!(report.full_recompute);
    assert_eq!(report.height, 4);

    // Receipts are publicly checkable
    let info = ballot_box.lookup_receipt(&receipts[0].receipt).unwrap();
    assert_eq!(info.election_id, "E1");

    // Audit decrypt returns the canonical ballot
    let plaintext = ballot_box.decrypt_ballot(receipts[0].ballot_id).unwrap();
    assert!(String::from_utf8(plaintext).unwrap().ends_with(r#""p":[2,1,3]}"#));

    // Signed results
    let bundle = ballot_box.results_bundle().unwrap();
    assert_eq!(bundle.total_ballots(), 4);
    assert_eq!(bundle.chain_tip, tip.tip_hash);
    let signed = signer.sign_bundle(&bundle).unwrap();
    assert!(signed.verify_with(&signer.public_key()).unwrap());

    // Dual-controlled export and backup
    let gate = ActionGate::new(&config, store.clone(), keys.clone());
    let engine = ApprovalEngine::new(store.clone(), gate);

    let export = engine
        .request_for(ActionKind::Export, "admin@example.org", "E1")
        .unwrap();
    engine.approve(export.id, "alice@example.org").unwrap();
    assert!(!exports.join(format!("export_{}.json", export.id)).exists());
    let done = engine.approve(export.id, "bob@example.org").unwrap();
    assert_eq!(done.status, ActionStatus::Done);

    let record: ExportRecord = serde_json::from_slice(
        &std::fs::read(exports.join(format!("export_{}.json", export.id))).unwrap(),
    )
    .unwrap();
    assert_eq!(record.ballots_count, 3);
    assert_eq!(record.approvers, vec!["alice@example.org", "bob@example.org"]);

    let backup = engine.request(ActionKind::Backup, "admin@example.org").unwrap();
    engine.approve(backup.id, "alice@example.org").unwrap();
    engine.approve(backup.id, "carol@example.org").unwrap();
    let enc = std::fs::read_dir(&backups)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().map_or(false, |e| e == "enc"))
        .unwrap();
    let snapshot = restore_backup(&keys, &enc).unwrap();
    assert_eq!(snapshot.ballots.len(), 4);
    assert_eq!(snapshot.chain, store.chain().unwrap());
    assert!(verify_chain(&snapshot.chain).ok);

    // After a restart the same wrapped key decrypts old ballots
    let restarted = KeyManager::from_config(&config);
    let cipher = BallotCipher::new(restarted.get_or_create_active_key().unwrap());
    let stored = store.get_ballot(receipts[1].ballot_id).unwrap().unwrap();
    cipher.decrypt(&stored.ciphertext, &stored.nonce).unwrap();
}

#[test]
fn concurrent_submissions_both_commit() {
    let ballot_box = Arc::new(BallotBox::new(Arc::new(MemStore::new()), keys()));
    let before = ballot_box.tip().unwrap().height;

    let tokens: Vec<String> = (0..2)
        .map(|i| ballot_box.issue_token(&format!("ref-{}", i)).unwrap().token)
        .collect();

    let handles: Vec<_> = tokens
        .into_iter()
        .map(|token| {
            let ballot_box = ballot_box.clone();
            thread::spawn(move || {
                ballot_box
                    .submit(Some(token.as_str()), "E1", &[2, 1, 3])
                    .unwrap()
            })
        })
        .collect();
    let receipts: Vec<SubmissionReceipt> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_ne!(receipts[0].receipt, receipts[1].receipt);
    assert_eq!(ballot_box.tip().unwrap().height, before + 2);
    let report = ballot_box.verify().unwrap();
    assert!(report.ok, "{:?}", report.breaks);
}

#[test]
fn many_concurrent_submissions_never_fork() {
    let ballot_box = Arc::new(BallotBox::new(Arc::new(MemStore::new()), keys()));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let ballot_box = ballot_box.clone();
            let token = ballot_box.issue_token(&format!("ref-{}", i)).unwrap().token;
            thread::spawn(move || ballot_box.submit(Some(token.as_str()), "E1", &[1, 2]))
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => accepted += 1,
            // A submitter can lose the race twice; it must fail cleanly, never fork
            Err(Error::ChainContinuity { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    let tip = ballot_box.tip().unwrap();
    assert_eq!(tip.height, accepted);
    assert_eq!(ballot_box.store().ballots().unwrap().len() as u64, accepted);
    assert!(ballot_box.verify().unwrap().ok);
}

/// Moves the chain tip just before the first `commit_submission`, as another
/// submitter winning the race would
struct RacingStore {
    inner: MemStore,
    raced: AtomicBool,
    commits: AtomicUsize,
}

impl RacingStore {
    fn new() -> Self {
        RacingStore {
            inner: MemStore::new(),
            raced: AtomicBool::new(false),
            commits: AtomicUsize::new(0),
        }
    }

    fn sneak_in(&self) {
        let now = Utc::now();
        let token = OneTimeBallotToken::issue("racer", chrono::Duration::minutes(1), now);
        self.inner.put_token(token.clone()).unwrap();

        let tip = self.inner.chain().unwrap().last().and_then(|l| l.curr_hash_array());
        let prev = tip.unwrap_or(GENESIS_HASH);
        let ciphertext = vec![0xEE; 24];
        let nonce = vec![7; NONCE_LEN];
        let receipt = receipt(&ciphertext);

        self.inner
            .commit_submission(PendingSubmission {
                token: token.token,
                expected_prev: prev,
                curr_hash: append(&prev, &receipt, Some(nonce.as_slice())),
                ballot: NewBallot {
                    election_id: "E1".to_owned(),
                    ciphertext,
                    nonce,
                    receipt_hash: hex::encode(receipt),
                },
                now,
            })
            .unwrap();
    }
}

impl BallotStore for RacingStore {
    fn commit_submission(
        &self,
        submission: PendingSubmission,
    ) -> Result<(BallotRecord, ChainLink)> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if !self.raced.swap(true, Ordering::SeqCst) {
            self.sneak_in();
        }
        self.inner.commit_submission(submission)
    }

    fn chain_tip(&self) -> Result<ChainTip> {
        self.inner.chain_tip()
    }

    fn chain(&self) -> Result<Vec<ChainLink>> {
        self.inner.chain()
    }

    fn get_ballot(&self, id: BallotId) -> Result<Option<BallotRecord>> {
        self.inner.get_ballot(id)
    }

    fn find_by_receipt(&self, receipt_hash: &str) -> Result<Option<BallotRecord>> {
        self.inner.find_by_receipt(receipt_hash)
    }

    fn ballots(&self) -> Result<Vec<BallotRecord>> {
        self.inner.ballots()
    }
}

impl TokenStore for RacingStore {
    fn get_token(&self, token: &str) -> Result<Option<OneTimeBallotToken>> {
        self.inner.get_token(token)
    }

    fn put_token(&self, token: OneTimeBallotToken) -> Result<()> {
        self.inner.put_token(token)
    }

    fn delete_expired_tokens(&self, now: chrono::DateTime<Utc>) -> Result<usize> {
        self.inner.delete_expired_tokens(now)
    }
}

#[test]
fn lost_race_is_retried_against_new_tip() {
    let ballot_box = BallotBox::new(RacingStore::new(), keys());
    let token = ballot_box.issue_token("ref-1").unwrap();

    let receipt = ballot_box
        .submit(Some(token.token.as_str()), "E1", &[2, 1, 3])
        .unwrap();

    assert_eq!(ballot_box.store().commits.load(Ordering::SeqCst), 2);
    assert_eq!(receipt.ballot_id, 2);
    assert_eq!(ballot_box.tip().unwrap().height, 2);
    assert!(ballot_box.verify().unwrap().ok);

    // The token was consumed exactly once, by the successful retry
    assert!(ballot_box
        .store()
        .get_token(&token.token)
        .unwrap()
        .unwrap()
        .consumed_at
        .is_some());
}

#[test]
fn tampered_prev_hash_is_reported_at_that_link() {
    let store = Arc::new(MemStore::new());
    let ballot_box = BallotBox::new(store.clone(), keys());
    for i in 0..5 {
        let token = ballot_box.issue_token(&format!("ref-{}", i)).unwrap();
        ballot_box
            .submit(Some(token.token.as_str()), "E1", &[1, 2, 3])
            .unwrap();
    }
    assert!(ballot_box.verify().unwrap().ok);

    store.tamper_link(3, |link| link.prev_hash = Some(vec![0x5A; HASH_LEN]));

    let structural = ballot_box.verify_structure().unwrap();
    assert!(!structural.ok);
    assert_eq!(structural.total_breaks, 1);
    assert_eq!(structural.breaks[0].at_id, 3);

    // Recomputation also sees that link 3's curr_hash no longer follows from its prev
    let full = ballot_box.verify().unwrap();
    assert!(!full.ok);
    assert!(full.breaks.iter().all(|b| b.at_id == 3));
}

#[test]
fn tampered_ciphertext_is_rejected_not_decrypted() {
    let store = Arc::new(MemStore::new());
    let ballot_box = BallotBox::new(store.clone(), keys());
    let token = ballot_box.issue_token("ref").unwrap();
    let receipt = ballot_box
        .submit(Some(token.token.as_str()), "E1", &[1])
        .unwrap();

    let mut ballot = store.get_ballot(receipt.ballot_id).unwrap().unwrap();
    ballot.ciphertext[0] ^= 0x01;
    let cipher = BallotCipher::new(ballot_box.keys().get_or_create_active_key().unwrap());
    assert!(matches!(
        cipher.decrypt(&ballot.ciphertext, &ballot.nonce),
        Err(Error::Authentication)
    ));
}

#[test]
fn outcomes_at_the_boundary() {
    let engine = ApprovalEngine::new(
        MemStore::new(),
        |_: &Action, _: &[String]| -> Result<()> { Ok(()) },
    );
    let action = engine.request(ActionKind::Export, "admin@example.org").unwrap();

    let first = Outcome::from_result(engine.approve(action.id, "x@y")).unwrap();
    assert_eq!(first.accepted().unwrap().status, ActionStatus::Approved1);

    let repeat = Outcome::from_result(engine.approve(action.id, "x@y")).unwrap();
    assert_eq!(repeat.rejection().unwrap().code, "already_approved");

    let missing = Outcome::from_result(engine.approve(404, "x@y")).unwrap();
    assert_eq!(missing.rejection().unwrap().code, "not_found");
}

#[test]
fn dual_control_over_one_shared_store() {
    use chrono::TimeZone;
    use std::sync::mpsc;
    use std::time::Duration;

    let dir = tempfile::tempdir().unwrap();
    let exports = dir.path().join("exports");
    let backups = dir.path().join("backup");
    let store = Arc::new(MemStore::new());
    let keys = keys();

    let ballot_box = BallotBox::new(store.clone(), keys.clone());
    for i in 0..3 {
        let token = ballot_box.issue_token(&format!("ref-{}", i)).unwrap();
        let election = if i == 2 { "E2" } else { "E1" };
        ballot_box
            .submit(Some(token.token.as_str()), election, &[1, 2])
            .unwrap();
    }

    // The gate reads ballots from the same store whose action row the engine holds
    let gate = ActionGate::from_parts(
        ExportWriter::new(&exports, store.clone()),
        EncryptedBackup::new(&backups, store.clone(), keys.clone()),
    );
    let engine: Arc<ApprovalEngine<Arc<MemStore>, ActionGate<Arc<MemStore>>>> =
        Arc::new(ApprovalEngine::new(store.clone(), gate));

    let export = engine
        .request_for(ActionKind::Export, "admin@example.org", "E1")
        .unwrap();
    assert_eq!(export.status, ActionStatus::Pending);
    let first = engine.approve(export.id, "alice@example.org").unwrap();
    assert_eq!(first.status, ActionStatus::Approved1);
    assert!(!exports.join(format!("export_{}.json", export.id)).exists());

    // The deciding approval must finish, not wait on the store
    let at = Utc.ymd(2025, 3, 1).and_hms(12, 0, 0);
    let (tx, rx) = mpsc::channel();
    let worker = engine.clone();
    let id = export.id;
    thread::spawn(move || {
        tx.send(worker.approve_at(id, "bob@example.org", at)).unwrap();
    });
    let done = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("second approval did not complete")
        .unwrap();
    assert_eq!(done.status, ActionStatus::Done);
    assert_eq!(done.executed_at, Some(at));

    let path = exports.join(format!("export_{}.json", export.id));
    let written = std::fs::read(&path).unwrap();
    let record: ExportRecord = serde_json::from_slice(&written).unwrap();
    assert_eq!(record.ballots_count, 2);
    assert_eq!(record.election_id.as_deref(), Some("E1"));
    assert_eq!(record.executed_at, at);
    assert_eq!(record.approvers, vec!["alice@example.org", "bob@example.org"]);

    // A third distinct approver changes nothing
    let after = engine.approve(export.id, "carol@example.org").unwrap();
    assert_eq!(after, done);
    assert_eq!(std::fs::read_dir(&exports).unwrap().count(), 1);
    assert_eq!(std::fs::read(&path).unwrap(), written);
    assert_eq!(engine.get(export.id).unwrap().approvals.len(), 2);

    // Backups snapshot the same store
    let backup = engine.request(ActionKind::Backup, "ops@example.org").unwrap();
    engine.approve(backup.id, "alice@example.org").unwrap();
    let done = engine.approve(backup.id, "dave@example.org").unwrap();
    assert_eq!(done.status, ActionStatus::Done);

    let enc = std::fs::read_dir(&backups)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().map_or(false, |ext| ext == "enc"))
        .unwrap();
    let snapshot = restore_backup(&keys, &enc).unwrap();
    assert_eq!(snapshot.ballots.len(), 3);
    assert_eq!(snapshot.chain, store.chain().unwrap());
}
