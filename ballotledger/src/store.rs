use crate::*;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Everything needed to commit one ballot submission
#[derive(Debug, Clone)]
pub struct PendingSubmission {
    /// The one-time token authorising the submission
    pub token: String,

    /// The tip hash `curr_hash` was computed against
    pub expected_prev: [u8; HASH_LEN],
    pub curr_hash: [u8; HASH_LEN],
    pub ballot: NewBallot,
    pub now: DateTime<Utc>,
}

/// Ballot and chain storage
pub trait BallotStore: Send + Sync {
    /// Commit a submission as a single atomic unit.
    ///
    /// Implementations must, all-or-nothing: check that the chain tip still equals
    /// `expected_prev` (else `ChainContinuity`), consume the token (else
    /// `Error::Token`), insert the ballot, and append the chain link. If any step
    /// fails nothing is written and the token stays unconsumed.
    fn commit_submission(&self, submission: PendingSubmission)
        -> Result<(BallotRecord, ChainLink)>;

    fn chain_tip(&self) -> Result<ChainTip>;

    /// All links in ascending id order
    fn chain(&self) -> Result<Vec<ChainLink>>;

    fn get_ballot(&self, id: BallotId) -> Result<Option<BallotRecord>>;

    fn find_by_receipt(&self, receipt_hash: &str) -> Result<Option<BallotRecord>>;

    /// All ballots in ascending id order
    fn ballots(&self) -> Result<Vec<BallotRecord>>;

    /// Ballot count per election, in first-seen order
    fn ballot_counts(&self) -> Result<IndexMap<String, u64>> {
        let mut counts = IndexMap::new();
        for ballot in self.ballots()? {
            *counts.entry(ballot.election_id).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// One-time token repository
pub trait TokenStore: Send + Sync {
    fn get_token(&self, token: &str) -> Result<Option<OneTimeBallotToken>>;

    fn put_token(&self, token: OneTimeBallotToken) -> Result<()>;

    /// Remove every token that expired at or before `now`. Returns how many were removed.
    fn delete_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// An action together with its recorded approvals
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActionEntry {
    pub action: Action,
    pub approvals: Vec<Approval>,
}

impl ActionEntry {
    pub fn has_approved(&self, principal: &str) -> bool {
        self.approvals.iter().any(|a| a.principal == principal)
    }

    pub fn approvers(&self) -> Vec<String> {
        self.approvals.iter().map(|a| a.principal.clone()).collect()
    }
}

/// Sensitive-action repository
pub trait ActionStore: Send + Sync {
    fn create_action(
        &self,
        kind: ActionKind,
        requested_by: &str,
        subject: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Action>;

    fn get_action(&self, id: ActionId) -> Result<Option<ActionEntry>>;

    /// Run `f` against an action with exclusive access, committing its changes only
    /// if it returns `Ok`.
    ///
    /// The commit enforces uniqueness of `(action_id, principal)` among approvals.
    /// No other `transact_action` on the same action may interleave with `f`.
    fn transact_action<T, F>(&self, id: ActionId, f: F) -> Result<T>
    where
        F: FnOnce(&mut ActionEntry) -> Result<T>;
}

impl<S: BallotStore + ?Sized> BallotStore for Arc<S> {
    fn commit_submission(
        &self,
        submission: PendingSubmission,
    ) -> Result<(BallotRecord, ChainLink)> {
        (**self).commit_submission(submission)
    }

    fn chain_tip(&self) -> Result<ChainTip> {
        (**self).chain_tip()
    }

    fn chain(&self) -> Result<Vec<ChainLink>> {
        (**self).chain()
    }

    fn get_ballot(&self, id: BallotId) -> Result<Option<BallotRecord>> {
        (**self).get_ballot(id)
    }

    fn find_by_receipt(&self, receipt_hash: &str) -> Result<Option<BallotRecord>> {
        (**self).find_by_receipt(receipt_hash)
    }

    fn ballots(&self) -> Result<Vec<BallotRecord>> {
        (**self).ballots()
    }
}

impl<S: TokenStore + ?Sized> TokenStore for Arc<S> {
    fn get_token(&self, token: &str) -> Result<Option<OneTimeBallotToken>> {
        (**self).get_token(token)
    }

    fn put_token(&self, token: OneTimeBallotToken) -> Result<()> {
        (**self).put_token(token)
    }

    fn delete_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        (**self).delete_expired_tokens(now)
    }
}

impl<S: ActionStore> ActionStore for Arc<S> {
    fn create_action(
        &self,
        kind: ActionKind,
        requested_by: &str,
        subject: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Action> {
        (**self).create_action(kind, requested_by, subject, now)
    }

    fn get_action(&self, id: ActionId) -> Result<Option<ActionEntry>> {
        (**self).get_action(id)
    }

    fn transact_action<T, F>(&self, id: ActionId, f: F) -> Result<T>
    where
        F: FnOnce(&mut ActionEntry) -> Result<T>,
    {
        (**self).transact_action(id, f)
    }
}

#[derive(Default)]
struct Tables {
    ballots: BTreeMap<BallotId, BallotRecord>,
    links: Vec<ChainLink>,
    tokens: BTreeMap<String, OneTimeBallotToken>,
}

#[derive(Default)]
struct ActionTables {
    actions: BTreeMap<ActionId, ActionEntry>,
    next_action_id: ActionId,
}

/// A simple store that keeps everything in memory.
///
/// Ballots, chain links and tokens share one lock, so holding it for the whole of a
/// commit gives the same guarantees as a serializable transaction in a relational
/// store. Actions have their own lock: a gated side effect reads the ballot tables
/// while its action is held. Lock order is always actions before tables.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Tables>,
    actions: Mutex<ActionTables>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    fn tables(&self) -> Result<MutexGuard<Tables>> {
        self.inner
            .lock()
            .map_err(|_| Error::Corrupt("store lock poisoned".to_owned()))
    }

    fn action_tables(&self) -> Result<MutexGuard<ActionTables>> {
        self.actions
            .lock()
            .map_err(|_| Error::Corrupt("action lock poisoned".to_owned()))
    }

    /// Overwrite a stored chain link in place
    #[cfg(test)]
    pub(crate) fn tamper_link<F: FnOnce(&mut ChainLink)>(&self, id: u64, f: F) {
        let mut tables = self.tables().unwrap();
        let link = tables.links.iter_mut().find(|l| l.id == id).unwrap();
        f(link);
    }
}

impl BallotStore for MemStore {
    fn commit_submission(
        &self,
        submission: PendingSubmission,
    ) -> Result<(BallotRecord, ChainLink)> {
        let mut tables = self.tables()?;

        // Validate everything before the first write
        let mut token = tables
            .tokens
            .get(&submission.token)
            .cloned()
            .ok_or(TokenRejection::Unknown)?;
        token.consume(submission.now)?;

        let tip = tables
            .links
            .last()
            .map(|l| l.curr_hash_array())
            .unwrap_or(Some(GENESIS_HASH));
        if tip != Some(submission.expected_prev) {
            return Err(Error::ChainContinuity {
                expected: hex::encode(submission.expected_prev),
                found: tip.map(hex::encode).unwrap_or_else(|| "<malformed>".to_owned()),
            });
        }

        let ballot_id = tables.ballots.keys().next_back().map_or(1, |id| id + 1);
        let link_id = tables.links.last().map_or(1, |l| l.id + 1);

        // Commit order wins over caller clocks: created_at never goes backwards
        let created_at = tables
            .links
            .last()
            .and_then(|l| l.created_at)
            .map_or(submission.now, |last| last.max(submission.now));

        let record = submission.ballot.into_record(ballot_id, created_at);
        let link = ChainLink::new(
            link_id,
            ballot_id,
            submission.expected_prev,
            submission.curr_hash,
            created_at,
        );

        tables.tokens.insert(token.token.clone(), token);
        tables.ballots.insert(ballot_id, record.clone());
        tables.links.push(link.clone());

        Ok((record, link))
    }

    fn chain_tip(&self) -> Result<ChainTip> {
        let tables = self.tables()?;
        match tables.links.last() {
            Some(link) => ChainTip::from_link(tables.links.len() as u64, link),
            None => Ok(ChainTip::empty()),
        }
    }

    fn chain(&self) -> Result<Vec<ChainLink>> {
        Ok(self.tables()?.links.clone())
    }

    fn get_ballot(&self, id: BallotId) -> Result<Option<BallotRecord>> {
        Ok(self.tables()?.ballots.get(&id).cloned())
    }

    fn find_by_receipt(&self, receipt_hash: &str) -> Result<Option<BallotRecord>> {
        Ok(self
            .tables()?
            .ballots
            .values()
            .find(|b| b.receipt_hash == receipt_hash)
            .cloned())
    }

    fn ballots(&self) -> Result<Vec<BallotRecord>> {
        Ok(self.tables()?.ballots.values().cloned().collect())
    }
}

impl TokenStore for MemStore {
    fn get_token(&self, token: &str) -> Result<Option<OneTimeBallotToken>> {
        Ok(self.tables()?.tokens.get(token).cloned())
    }

    fn put_token(&self, token: OneTimeBallotToken) -> Result<()> {
        self.tables()?.tokens.insert(token.token.clone(), token);
        Ok(())
    }

    fn delete_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.tables()?;
        let before = tables.tokens.len();
        tables.tokens.retain(|_, t| !t.is_expired(now));
        Ok(before - tables.tokens.len())
    }
}

impl ActionStore for MemStore {
    fn create_action(
        &self,
        kind: ActionKind,
        requested_by: &str,
        subject: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Action> {
        let mut tables = self.action_tables()?;
        tables.next_action_id += 1;
        let action = Action {
            id: tables.next_action_id,
            kind,
            status: ActionStatus::Pending,
            requested_by: requested_by.to_owned(),
            subject,
            created_at: now,
            executed_at: None,
        };
        tables.actions.insert(
            action.id,
            ActionEntry {
                action: action.clone(),
                approvals: Vec::new(),
            },
        );
        Ok(action)
    }

    fn get_action(&self, id: ActionId) -> Result<Option<ActionEntry>> {
        Ok(self.action_tables()?.actions.get(&id).cloned())
    }

    fn transact_action<T, F>(&self, id: ActionId, f: F) -> Result<T>
    where
        F: FnOnce(&mut ActionEntry) -> Result<T>,
    {
        let mut tables = self.action_tables()?;
        let mut entry = tables
            .actions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("action", id))?;

        let result = f(&mut entry)?;

        // Unique (action_id, principal)
        for (i, approval) in entry.approvals.iter().enumerate() {
            if entry.approvals[..i]
                .iter()
                .any(|a| a.principal == approval.principal)
            {
                return Err(Error::AlreadyApproved {
                    action_id: id,
                    principal: approval.principal.clone(),
                });
            }
        }

        tables.actions.insert(id, entry);
        Ok(result)
    }
}
