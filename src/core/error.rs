use thiserror::Error;

/// Failure modes surfaced at the simulation boundary. A depleted portfolio
/// is a normal outcome and never reported through this type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("invalid scenario: {0}")]
    Validation(String),

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("simulation cancelled")]
    Cancelled,

    #[error("internal invariant violated at path {path}, year {year}: {message}")]
    Internal {
        path: usize,
        year: usize,
        message: String,
    },
}

impl SimulationError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SimulationError::Validation(msg.into())
    }

    pub fn numerical(msg: impl Into<String>) -> Self {
        SimulationError::Numerical(msg.into())
    }
}
