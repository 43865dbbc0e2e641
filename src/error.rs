//! Error types for the validation engine
//!
//! Block and header validity is never reported through these types: a block that
//! breaks a consensus rule is data, described by a
//! [`BlockValidationState`](crate::validation_state::BlockValidationState). The
//! errors here describe malformed input, malformed requests and failures of the
//! engine's collaborators.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Script verification request rejected: {0}")]
    ScriptVerify(#[from] ScriptVerifyError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Operation interrupted")]
    Interrupted,

    #[error("Consensus rule violation: {0}")]
    ConsensusRuleViolation(String),
}

impl ConsensusError {
    /// Storage failures may be retried; everything else is final for the request.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConsensusError::Storage(_) | ConsensusError::Interrupted)
    }
}

/// Ways a script verification request can be malformed.
///
/// These never say anything about the script itself, only that the caller asked
/// the question in a way that cannot be answered.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptVerifyError {
    #[error("the verification flags were combined in an invalid way")]
    InvalidFlagsCombination,

    #[error("the taproot flag was set, so the spent outputs have to be provided")]
    SpentOutputsRequired,

    #[error("{provided} spent outputs were provided for a transaction with {inputs} inputs")]
    SpentOutputsMismatch { provided: usize, inputs: usize },

    #[error("input index {index} is out of range for a transaction with {inputs} inputs")]
    InputIndexOutOfRange { index: usize, inputs: usize },

    #[error("unknown verification flags {0:#x}")]
    UnknownFlags(u32),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

impl From<std::io::Error> for ConsensusError {
    fn from(err: std::io::Error) -> Self {
        ConsensusError::Storage(err.to_string())
    }
}
