//! Crate-level error type

use thiserror::Error;

use crate::kubernetes::{ClientConstructionError, CredentialResolutionError, ExecError};

/// Any failure of a resolve → client → exec run
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    CredentialResolution(#[from] CredentialResolutionError),

    #[error(transparent)]
    ClientConstruction(#[from] ClientConstructionError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl Error {
    /// Short, stable name for log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::CredentialResolution(_) => "credential_resolution",
            Error::ClientConstruction(_) => "client_construction",
            Error::Exec(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
