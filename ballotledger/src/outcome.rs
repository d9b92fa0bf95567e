use crate::*;

/// An expected refusal of a request, as seen by a caller
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Rejection {
    pub code: String,
    pub detail: String,
}

/// Result of an operation at the API boundary.
///
/// Expected refusals (a repeated approval, an unknown action, a spent token) are
/// values. Faults such as I/O errors or failed decryption remain `Err`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum Outcome<T> {
    Accepted(T),
    Rejected(Rejection),
}

impl<T> Outcome<T> {
    /// Split a `Result` into an outcome, keeping genuine faults as errors
    pub fn from_result(result: Result<T>) -> Result<Outcome<T>> {
        match result {
            Ok(value) => Ok(Outcome::Accepted(value)),
            Err(e) => match e.rejection_code() {
                Some(code) => Ok(Outcome::Rejected(Rejection {
                    code: code.to_owned(),
                    detail: e.to_string(),
                })),
                None => Err(e),
            },
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted(_))
    }

    pub fn accepted(self) -> Option<T> {
        match self {
            Outcome::Accepted(value) => Some(value),
            Outcome::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Accepted(_) => None,
            Outcome::Rejected(rejection) => Some(rejection),
        }
    }
}
