use crate::acme::object::Identifier;
use crate::crypto::SignatureError;
use serde::Deserialize;
use std::fmt::{Display, Formatter};

pub type ProtocolResult<T> = Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Http(reqwest::Error),
    AcmeProblem(Problem),
    ProtocolViolation(&'static str),
    CryptoFailure(SignatureError),
    DeserializationFailed(serde_json::Error),
    TimedOut(&'static str),
}

impl Error {
    pub async fn get_error_from_http(err_response: reqwest::Response) -> Error {
        let status = err_response.status();
        match err_response.json::<Problem>().await {
            Ok(mut problem) => {
                problem.status.get_or_insert(status.as_u16());
                Error::AcmeProblem(problem)
            }
            Err(_) => Error::AcmeProblem(Problem {
                typ: "unknown".to_string(),
                detail: Some(format!("HTTP error: {status}")),
                status: Some(status.as_u16()),
                subproblems: vec![],
            }),
        }
    }

    /// Whether re-running the whole issuance later may succeed without operator intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) | Error::TimedOut(_) => true,
            Error::AcmeProblem(problem) => problem.is_server_failure() || problem.is_bad_nonce(),
            Error::ProtocolViolation(_)
            | Error::CryptoFailure(_)
            | Error::DeserializationFailed(_) => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Error {
        Error::Http(err)
    }
}

impl From<Problem> for Error {
    fn from(err: Problem) -> Error {
        Error::AcmeProblem(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::DeserializationFailed(err)
    }
}

impl From<SignatureError> for Error {
    fn from(err: SignatureError) -> Error {
        Error::CryptoFailure(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            Error::Http(e) => {
                write!(f, "HTTP error: {e}")
            }
            Error::AcmeProblem(e) => {
                write!(f, "The CA reported a problem: {e}")
            }
            Error::ProtocolViolation(e) => write!(f, "ACME protocol specification violated: {e}"),
            Error::CryptoFailure(msg) => {
                write!(f, "error during cryptographic operation: {msg}")
            }
            Error::DeserializationFailed(serde) => {
                write!(f, "parsing server response failed: {serde}")
            }
            Error::TimedOut(msg) => {
                write!(f, "timeout: {msg}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        // Skip one level (i.e. directly call source on the embedded error)
        // because we already print the higher-level error during Display, so don't duplicate it in the chain.
        match &self {
            Error::Http(e) => e.source(),
            Error::DeserializationFailed(serde) => serde.source(),
            Error::CryptoFailure(crypto) => crypto.source(),
            Error::AcmeProblem(_) | Error::ProtocolViolation(_) | Error::TimedOut(_) => None,
        }
    }
}

pub const ACME_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
pub const ACME_SERVER_INTERNAL: &str = "urn:ietf:params:acme:error:serverInternal";

/// An RFC 7807 problem document as returned by the CA.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
pub struct Problem {
    #[serde(rename = "type")]
    pub typ: String,
    pub detail: Option<String>,
    /// HTTP status, either from the document itself or from the response carrying it
    pub status: Option<u16>,
    #[serde(default)]
    pub subproblems: Vec<Subproblem>,
}

impl Problem {
    pub fn is_bad_nonce(&self) -> bool {
        self.typ == ACME_BAD_NONCE || self.subproblems.iter().any(Subproblem::is_bad_nonce)
    }

    pub fn is_server_failure(&self) -> bool {
        self.typ == ACME_SERVER_INTERNAL
            || self.status.is_some_and(|status| status >= 500)
            || self.subproblems.iter().any(Subproblem::is_server_failure)
    }
}

impl Display for Problem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let typ = &self.typ;
        match &self.detail {
            Some(detail) => write!(f, "{detail} ({typ}")?,
            None => write!(f, "{typ} (no detail")?,
        }
        if let Some(status) = self.status {
            write!(f, ", HTTP {status}")?;
        }
        write!(f, ")")?;
        for subproblem in &self.subproblems {
            write!(f, "\nadditionally, the server reported:\n{subproblem}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub typ: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}

impl Subproblem {
    pub fn is_bad_nonce(&self) -> bool {
        self.typ == ACME_BAD_NONCE
    }

    pub fn is_server_failure(&self) -> bool {
        self.typ == ACME_SERVER_INTERNAL
    }
}

impl Display for Subproblem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let typ = &self.typ;
        if let Some(detail) = &self.detail {
            write!(f, "{detail}")?;
        } else {
            write!(f, "{typ}")?;
        }
        if let Some(identifier) = &self.identifier {
            write!(f, " (for identifier: {identifier})")?;
        }
        Ok(())
    }
}
