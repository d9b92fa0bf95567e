use crate::*;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

pub const TOKEN_BYTES: usize = 32;

/// Why a ballot token was not accepted
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    #[error("no ballot token supplied")]
    Missing,

    #[error("unknown ballot token")]
    Unknown,

    #[error("ballot token expired")]
    Expired,

    #[error("ballot token already used")]
    AlreadyUsed,
}

impl TokenRejection {
    pub fn code(&self) -> &'static str {
        match self {
            TokenRejection::Missing => "token_missing",
            TokenRejection::Unknown => "token_invalid",
            TokenRejection::Expired => "token_expired",
            TokenRejection::AlreadyUsed => "token_used",
        }
    }
}

/// A credential authorising exactly one ballot submission.
///
/// `voter_ref` is an opaque, non-identifying reference. It is never copied onto the
/// ballot or into the chain.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OneTimeBallotToken {
    pub token: String,
    pub voter_ref: String,
    pub exp_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl OneTimeBallotToken {
    /// Issue a new random token valid for `ttl` from `now`
    pub fn issue(voter_ref: &str, ttl: Duration, now: DateTime<Utc>) -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);

        OneTimeBallotToken {
            token: hex::encode(bytes),
            voter_ref: voter_ref.to_owned(),
            exp_at: now + ttl,
            consumed_at: None,
        }
    }

    /// A token is usable while unexpired and unconsumed. Expiry is exclusive.
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), TokenRejection> {
        if self.consumed_at.is_some() {
            return Err(TokenRejection::AlreadyUsed);
        }
        if now >= self.exp_at {
            return Err(TokenRejection::Expired);
        }
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.exp_at
    }

    /// Mark the token used. Only ever called inside the store's submission commit.
    pub(crate) fn consume(&mut self, now: DateTime<Utc>) -> Result<(), TokenRejection> {
        self.check(now)?;
        self.consumed_at = Some(now);
        Ok(())
    }
}
