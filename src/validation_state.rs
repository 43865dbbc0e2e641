//! Outcomes of block and transaction validation
//!
//! A failed consensus check is not an error of the engine: it is a property of
//! the data. These types carry that property back to the caller so it can
//! decide what to do with the peer that sent it.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValidationMode {
    #[default]
    Valid,
    /// The data broke a rule
    Invalid,
    /// The engine could not finish the check (storage failure and the like)
    InternalError,
}

/// Why a block was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlockValidationResult {
    #[default]
    Unset,
    /// Invalid by a consensus rule not covered below
    Consensus,
    /// Known invalid from an earlier check
    CachedInvalid,
    /// Bad proof of work or timestamp
    InvalidHeader,
    /// The body does not match the header's commitments
    Mutated,
    MissingPrev,
    InvalidPrev,
    TimeFuture,
    HeaderLowWork,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockValidationState {
    mode: ValidationMode,
    result: BlockValidationResult,
    reject_reason: String,
    debug_message: String,
}

impl BlockValidationState {
    pub fn new() -> Self {
        BlockValidationState::default()
    }

    /// Record a rule violation; returns `false` so checks can `return state.invalid(..)`
    pub fn invalid(&mut self, result: BlockValidationResult, reason: &str, debug_message: &str) -> bool {
        self.mode = ValidationMode::Invalid;
        self.result = result;
        self.reject_reason = reason.to_string();
        self.debug_message = debug_message.to_string();
        false
    }

    pub fn error(&mut self, reason: &str) -> bool {
        if self.mode == ValidationMode::Valid {
            self.reject_reason = reason.to_string();
        }
        self.mode = ValidationMode::InternalError;
        false
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    pub fn result(&self) -> BlockValidationResult {
        self.result
    }

    pub fn reject_reason(&self) -> &str {
        &self.reject_reason
    }

    pub fn debug_message(&self) -> &str {
        &self.debug_message
    }

    pub fn is_valid(&self) -> bool {
        self.mode == ValidationMode::Valid
    }

    pub fn is_invalid(&self) -> bool {
        self.mode == ValidationMode::Invalid
    }

    pub fn is_error(&self) -> bool {
        self.mode == ValidationMode::InternalError
    }
}

impl fmt::Display for BlockValidationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            return f.write_str("Valid");
        }
        f.write_str(&self.reject_reason)?;
        if !self.debug_message.is_empty() {
            write!(f, ", {}", self.debug_message)?;
        }
        Ok(())
    }
}

/// Why a transaction was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TxValidationResult {
    #[default]
    Unset,
    Consensus,
    /// An input refers to a coin that does not exist
    MissingInputs,
    /// A coinbase output is spent before it matured
    PrematureSpend,
}

/// Rejection of one transaction inside a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxValidationError {
    pub result: TxValidationResult,
    pub reject_reason: String,
    pub debug_message: String,
}

impl TxValidationError {
    pub fn consensus(reason: &str) -> Self {
        Self::new(TxValidationResult::Consensus, reason, "")
    }

    pub fn new(result: TxValidationResult, reason: &str, debug_message: &str) -> Self {
        TxValidationError {
            result,
            reject_reason: reason.to_string(),
            debug_message: debug_message.to_string(),
        }
    }
}

impl fmt::Display for TxValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reject_reason)?;
        if !self.debug_message.is_empty() {
            write!(f, ", {}", self.debug_message)?;
        }
        Ok(())
    }
}
