use crate::*;
use chrono::{DateTime, Utc};

pub type ActionId = u64;

/// Distinct approvals needed before a gated action runs
pub const REQUIRED_APPROVALS: usize = 2;

/// A sensitive action that needs dual control
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Export,
    Backup,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ActionKind::Export => write!(f, "export"),
            ActionKind::Backup => write!(f, "backup"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    #[serde(rename = "PENDING")]
    Pending,

    #[serde(rename = "APPROVED_1")]
    Approved1,

    /// Terminal
    #[serde(rename = "DONE")]
    Done,
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ActionStatus::Pending => write!(f, "PENDING"),
            ActionStatus::Approved1 => write!(f, "APPROVED_1"),
            ActionStatus::Done => write!(f, "DONE"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    pub status: ActionStatus,
    pub requested_by: String,

    /// What the action applies to, for example the election id of an export
    pub subject: Option<String>,

    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Approval {
    pub action_id: ActionId,
    pub principal: String,
    pub approved_at: DateTime<Utc>,
}

/// The side effect behind an action.
///
/// Runs exactly once, inside the same atomic unit that records the deciding approval.
/// `action.executed_at` is already set to the time of that approval.
/// An error aborts that unit: the approval is not recorded and the action stays
/// `APPROVED_1`.
pub trait GatedAction: Send + Sync {
    fn execute(&self, action: &Action, approvers: &[String]) -> Result<()>;
}

impl<F> GatedAction for F
where
    F: Fn(&Action, &[String]) -> Result<()> + Send + Sync,
{
    fn execute(&self, action: &Action, approvers: &[String]) -> Result<()> {
        self(action, approvers)
    }
}

/// Lower-case and trim a principal, which must look like `local@domain`
pub fn normalize_principal(principal: &str) -> Result<String> {
    let normalized = principal.trim().to_lowercase();
    let mut parts = normalized.splitn(2, '@');
    match (parts.next(), parts.next()) {
        (Some(local), Some(domain))
            if !local.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            Ok(normalized)
        }
        _ => Err(Error::InvalidPrincipal(principal.to_owned())),
    }
}

/// Dual-control approval state machine
///
/// ```text
/// PENDING --1st distinct approval--> APPROVED_1 --2nd distinct approval--> DONE
/// ```
pub struct ApprovalEngine<S, G> {
    store: S,
    gate: G,
}

impl<S: ActionStore, G: GatedAction> ApprovalEngine<S, G> {
    pub fn new(store: S, gate: G) -> Self {
        ApprovalEngine { store, gate }
    }

    pub fn request(&self, kind: ActionKind, requested_by: &str) -> Result<Action> {
        self.request_at(kind, requested_by, None, Utc::now())
    }

    pub fn request_for(
        &self,
        kind: ActionKind,
        requested_by: &str,
        subject: &str,
    ) -> Result<Action> {
        self.request_at(kind, requested_by, Some(subject.to_owned()), Utc::now())
    }

    pub fn request_at(
        &self,
        kind: ActionKind,
        requested_by: &str,
        subject: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Action> {
        let requested_by = normalize_principal(requested_by)?;
        let action = self.store.create_action(kind, &requested_by, subject, now)?;
        info!("{} action {} requested", action.kind, action.id);
        Ok(action)
    }

    pub fn approve(&self, action_id: ActionId, principal: &str) -> Result<Action> {
        self.approve_at(action_id, principal, Utc::now())
    }

    /// Record an approval by `principal`.
    ///
    /// A principal who already approved gets `AlreadyApproved`, even once the action is
    /// done. Any other approval of a done action returns it unchanged.
    pub fn approve_at(
        &self,
        action_id: ActionId,
        principal: &str,
        now: DateTime<Utc>,
    ) -> Result<Action> {
        let principal = normalize_principal(principal)?;
        let gate = &self.gate;

        self.store.transact_action(action_id, |entry| {
            if entry.has_approved(&principal) {
                return Err(Error::AlreadyApproved {
                    action_id,
                    principal: principal.clone(),
                });
            }

            if entry.action.status == ActionStatus::Done {
                debug!("action {} already done, approval ignored", action_id);
                return Ok(entry.action.clone());
            }

            entry.approvals.push(Approval {
                action_id,
                principal: principal.clone(),
                approved_at: now,
            });

            if entry.approvals.len() >= REQUIRED_APPROVALS {
                // The gate sees the execution time that will be recorded
                let approvers = entry.approvers();
                entry.action.executed_at = Some(now);
                gate.execute(&entry.action, &approvers)?;
                entry.action.status = ActionStatus::Done;
                info!(
                    "{} action {} executed after {} approvals",
                    entry.action.kind,
                    action_id,
                    approvers.len()
                );
            } else {
                entry.action.status = ActionStatus::Approved1;
                info!("{} action {} approved once", entry.action.kind, action_id);
            }

            Ok(entry.action.clone())
        })
    }

    pub fn get(&self, action_id: ActionId) -> Result<ActionEntry> {
        self.store
            .get_action(action_id)?
            .ok_or_else(|| Error::not_found("action", action_id))
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
