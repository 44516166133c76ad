use crate::acme::error::{Error as AcmeError, Problem};
use std::fmt::{Debug, Formatter};

pub type IssueResult<T> = Result<T, IssueError>;

/// Why an issuance attempt failed. Decides how the caller reacts: transient failures are simply
/// retried on the next scheduled run, everything else is reported as-is.
pub enum IssueError {
    /// Network trouble or CA-side hiccups. Retry on the next scheduled trigger.
    Transient(anyhow::Error),
    /// The CA answered with a problem or an `invalid` status.
    CaRejected(anyhow::Error),
    /// Key import, signing or CSR encoding failed. Needs operator attention.
    Crypto(anyhow::Error),
    DnsProvisioning(anyhow::Error),
    Cancelled(anyhow::Error),
}

impl IssueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IssueError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IssueError::Transient(_) => "transient",
            IssueError::CaRejected(_) => "ca_rejected",
            IssueError::Crypto(_) => "crypto",
            IssueError::DnsProvisioning(_) => "dns_provisioning",
            IssueError::Cancelled(_) => "cancelled",
        }
    }

    pub fn inner(&self) -> &anyhow::Error {
        match self {
            IssueError::Transient(err)
            | IssueError::CaRejected(err)
            | IssueError::Crypto(err)
            | IssueError::DnsProvisioning(err)
            | IssueError::Cancelled(err) => err,
        }
    }
}

impl std::error::Error for IssueError {}

impl std::fmt::Display for IssueError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.inner(), f)
    }
}

impl Debug for IssueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

impl From<anyhow::Error> for IssueError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<AcmeError>() {
            Some(inner) => match inner {
                AcmeError::CryptoFailure(_) => IssueError::Crypto(err),
                inner if inner.is_transient() => IssueError::Transient(err),
                AcmeError::AcmeProblem(_)
                | AcmeError::ProtocolViolation(_)
                | AcmeError::DeserializationFailed(_) => IssueError::CaRejected(err),
                AcmeError::Http(_) | AcmeError::TimedOut(_) => IssueError::Transient(err),
            },
            None => IssueError::Transient(err),
        }
    }
}

impl From<AcmeError> for IssueError {
    fn from(err: AcmeError) -> Self {
        anyhow::Error::new(err).into()
    }
}

impl From<Problem> for IssueError {
    fn from(err: Problem) -> Self {
        AcmeError::from(err).into()
    }
}

pub trait IssueContext<T> {
    fn transient(self) -> IssueResult<T>;
    fn ca_rejected(self) -> IssueResult<T>;
    fn crypto_failure(self) -> IssueResult<T>;
    fn dns_failure(self) -> IssueResult<T>;
}

impl<T> IssueContext<T> for anyhow::Error {
    fn transient(self) -> IssueResult<T> {
        Err(IssueError::Transient(self))
    }

    fn ca_rejected(self) -> IssueResult<T> {
        Err(IssueError::CaRejected(self))
    }

    fn crypto_failure(self) -> IssueResult<T> {
        Err(IssueError::Crypto(self))
    }

    fn dns_failure(self) -> IssueResult<T> {
        Err(IssueError::DnsProvisioning(self))
    }
}

impl<T> IssueContext<T> for Result<T, anyhow::Error> {
    fn transient(self) -> IssueResult<T> {
        match self {
            Ok(ok) => Ok(ok),
            Err(err) => err.transient(),
        }
    }

    fn ca_rejected(self) -> IssueResult<T> {
        match self {
            Ok(ok) => Ok(ok),
            Err(err) => err.ca_rejected(),
        }
    }

    fn crypto_failure(self) -> IssueResult<T> {
        match self {
            Ok(ok) => Ok(ok),
            Err(err) => err.crypto_failure(),
        }
    }

    fn dns_failure(self) -> IssueResult<T> {
        match self {
            Ok(ok) => Ok(ok),
            Err(err) => err.dns_failure(),
        }
    }
}
