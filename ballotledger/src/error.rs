use crate::*;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed key material / settings. Fatal at startup.
    #[error("ballotledger: configuration error: {0}")]
    Configuration(String),

    /// AEAD tag mismatch on decrypt. The ciphertext is left untouched.
    #[error("ballotledger: authentication failed: ciphertext or tag did not verify")]
    Authentication,

    #[error("ballotledger: key unwrap failed: wrong KEK, key id or corrupted blob")]
    KeyUnwrap,

    #[error("ballotledger: chain tip moved: expected prev_hash {expected}, current tip is {found}")]
    ChainContinuity { expected: String, found: String },

    #[error("ballotledger: {kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("ballotledger: {principal} already approved action {action_id}")]
    AlreadyApproved { action_id: ActionId, principal: String },

    #[error("ballotledger: duplicate candidate {0} in preferences")]
    DuplicatePreference(u32),

    #[error("ballotledger: invalid preferences: {0}")]
    InvalidPreferences(String),

    #[error("ballotledger: invalid election id: {0}")]
    InvalidElectionId(String),

    #[error("ballotledger: invalid principal: {0:?}")]
    InvalidPrincipal(String),

    #[error("ballotledger: invalid receipt: {0:?}")]
    InvalidReceipt(String),

    #[error("ballotledger: ballot token rejected: {0}")]
    Token(#[from] TokenRejection),

    #[error("ballotledger: malformed key material: {0}")]
    MalformedKey(String),

    #[error("ballotledger: encryption failure")]
    Encryption,

    #[error("ballotledger: stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("ballotledger: signature error: {0}")]
    Signature(#[from] ed25519_dalek::SignatureError),

    #[error("ballotledger: I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ballotledger: JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn not_found<T: ToString>(kind: &'static str, id: T) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Short machine-readable code for errors that are an expected rejection
    /// of a request rather than a fault.
    ///
    /// Returns `None` for genuine faults (I/O, corrupted data, crypto failures).
    pub fn rejection_code(&self) -> Option<&'static str> {
        match self {
            Error::NotFound { .. } => Some("not_found"),
            Error::AlreadyApproved { .. } => Some("already_approved"),
            Error::DuplicatePreference(_) => Some("duplicate_preference"),
            Error::InvalidPreferences(_) => Some("invalid_preferences"),
            Error::InvalidElectionId(_) => Some("invalid_election_id"),
            Error::InvalidPrincipal(_) => Some("invalid_principal"),
            Error::InvalidReceipt(_) => Some("invalid_receipt"),
            Error::Token(rejection) => Some(rejection.code()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_codes() {
        let err = Error::AlreadyApproved {
            action_id: 1,
            principal: "x@y".to_owned(),
        };
        assert_eq!(err.rejection_code(), Some("already_approved"));
        assert_eq!(
            Error::Token(TokenRejection::Expired).rejection_code(),
            Some("token_expired")
        );

        // Faults are never turned into rejections
        assert!(Error::Authentication.rejection_code().is_none());
        assert!(Error::KeyUnwrap.rejection_code().is_none());
        assert!(Error::Configuration("x".into()).rejection_code().is_none());
    }
}
