//! Subscriber interfaces
//!
//! Two groups of callbacks leave the engine. [`KernelNotifications`] carries
//! best-effort progress and warning events. [`ValidationInterface`] carries the
//! authoritative per-block events.
//!
//! The chainstate raises events while it holds its lock but only queues them
//! in an [`EventQueue`]. They are delivered on the calling thread once the
//! lock is released and before the call returns, so subscribers may query
//! the manager from inside a callback. Delivery order is the order in which
//! events were raised, across all threads.

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::chain::BlockTreeEntry;
use crate::error::ConsensusError;
use crate::types::Block;
use crate::validation_state::BlockValidationState;

/// Where the node stands in catching up with the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronizationState {
    InitReindex,
    InitDownload,
    PostInit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Warning {
    /// Most recent blocks signal version bits this engine does not know
    UnknownNewRulesActivated,
    /// An invalid chain carries substantially more work than the active one
    LargeWorkInvalidChain,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnknownNewRulesActivated => {
                f.write_str("Unknown new rules activated: the chain follows consensus rules this engine does not know")
            }
            Warning::LargeWorkInvalidChain => {
                f.write_str("A chain with much more work than the active chain was found invalid")
            }
        }
    }
}

/// Progress and health events
///
/// Every method has an empty default so subscribers implement what they need.
#[allow(unused_variables)]
pub trait KernelNotifications: Send + Sync {
    /// The active tip moved
    fn block_tip(&self, state: SynchronizationState, entry: &Arc<BlockTreeEntry>, verification_progress: f64) {}

    /// The best known header moved
    fn header_tip(&self, state: SynchronizationState, height: u32, timestamp: i64, presync: bool) {}

    fn progress(&self, title: &str, percent: u8, resume_possible: bool) {}

    fn warning_set(&self, warning: Warning, message: &str) {}

    fn warning_unset(&self, warning: Warning) {}

    /// Writing state to disk failed; the caller may retry later
    fn flush_error(&self, error: &ConsensusError) {}

    /// The engine can no longer vouch for its state
    fn fatal_error(&self, error: &ConsensusError) {}
}

/// Per-block validation events, in order: checked, then connected
#[allow(unused_variables)]
pub trait ValidationInterface: Send + Sync {
    fn block_checked(&self, block: &Arc<Block>, state: &BlockValidationState) {}

    /// A block passed the cheap checks and builds on the active tip
    fn pow_valid_block(&self, block: &Arc<Block>, entry: &Arc<BlockTreeEntry>) {}

    fn block_connected(&self, block: &Arc<Block>, entry: &Arc<BlockTreeEntry>) {}

    fn block_disconnected(&self, block: &Arc<Block>, entry: &Arc<BlockTreeEntry>) {}
}

/// Fans events out to every registered subscriber
#[derive(Clone, Default)]
pub(crate) struct Subscribers {
    pub notifications: Vec<Arc<dyn KernelNotifications>>,
    pub validation: Vec<Arc<dyn ValidationInterface>>,
}

impl Subscribers {
    pub fn block_tip(&self, state: SynchronizationState, entry: &Arc<BlockTreeEntry>, progress: f64) {
        self.notifications.iter().for_each(|n| n.block_tip(state, entry, progress));
    }

    pub fn header_tip(&self, state: SynchronizationState, entry: &BlockTreeEntry) {
        let timestamp = entry.header.timestamp as i64;
        self.notifications
            .iter()
            .for_each(|n| n.header_tip(state, entry.height, timestamp, false));
    }

    pub fn progress(&self, title: &str, percent: u8, resume_possible: bool) {
        self.notifications
            .iter()
            .for_each(|n| n.progress(title, percent, resume_possible));
    }

    pub fn warning_set(&self, warning: Warning) {
        let message = warning.to_string();
        self.notifications.iter().for_each(|n| n.warning_set(warning, &message));
    }

    pub fn warning_unset(&self, warning: Warning) {
        self.notifications.iter().for_each(|n| n.warning_unset(warning));
    }

    pub fn flush_error(&self, error: &ConsensusError) {
        self.notifications.iter().for_each(|n| n.flush_error(error));
    }

    pub fn fatal_error(&self, error: &ConsensusError) {
        self.notifications.iter().for_each(|n| n.fatal_error(error));
    }

    pub fn block_checked(&self, block: &Arc<Block>, state: &BlockValidationState) {
        self.validation.iter().for_each(|v| v.block_checked(block, state));
    }

    pub fn pow_valid_block(&self, block: &Arc<Block>, entry: &Arc<BlockTreeEntry>) {
        self.validation.iter().for_each(|v| v.pow_valid_block(block, entry));
    }

    pub fn block_connected(&self, block: &Arc<Block>, entry: &Arc<BlockTreeEntry>) {
        self.validation.iter().for_each(|v| v.block_connected(block, entry));
    }

    pub fn block_disconnected(&self, block: &Arc<Block>, entry: &Arc<BlockTreeEntry>) {
        self.validation.iter().for_each(|v| v.block_disconnected(block, entry));
    }
}

/// One queued event, owning what its callback needs
pub(crate) enum Event {
    BlockTip(SynchronizationState, Arc<BlockTreeEntry>, f64),
    HeaderTip(SynchronizationState, Arc<BlockTreeEntry>),
    Progress(String, u8, bool),
    WarningSet(Warning),
    WarningUnset(Warning),
    FlushError(ConsensusError),
    FatalError(ConsensusError),
    BlockChecked(Arc<Block>, BlockValidationState),
    PowValidBlock(Arc<Block>, Arc<BlockTreeEntry>),
    BlockConnected(Arc<Block>, Arc<BlockTreeEntry>),
    BlockDisconnected(Arc<Block>, Arc<BlockTreeEntry>),
}

impl Subscribers {
    fn dispatch(&self, event: Event) {
        match event {
            Event::BlockTip(state, entry, progress) => self.block_tip(state, &entry, progress),
            Event::HeaderTip(state, entry) => self.header_tip(state, &entry),
            Event::Progress(title, percent, resume) => self.progress(&title, percent, resume),
            Event::WarningSet(warning) => self.warning_set(warning),
            Event::WarningUnset(warning) => self.warning_unset(warning),
            Event::FlushError(error) => self.flush_error(&error),
            Event::FatalError(error) => self.fatal_error(&error),
            Event::BlockChecked(block, state) => self.block_checked(&block, &state),
            Event::PowValidBlock(block, entry) => self.pow_valid_block(&block, &entry),
            Event::BlockConnected(block, entry) => self.block_connected(&block, &entry),
            Event::BlockDisconnected(block, entry) => self.block_disconnected(&block, &entry),
        }
    }
}

/// Events raised under the chainstate lock, waiting for delivery
///
/// Queueing methods mirror [`Subscribers`]. Only one thread delivers at a
/// time; a callback that re-enters the manager delivers its own events
/// inline, after everything queued before them.
#[derive(Default)]
pub(crate) struct EventQueue {
    pending: Mutex<VecDeque<Event>>,
    delivering: ReentrantMutex<()>,
}

impl EventQueue {
    fn push(&self, event: Event) {
        self.pending.lock().push_back(event);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn block_tip(&self, state: SynchronizationState, entry: &Arc<BlockTreeEntry>, progress: f64) {
        self.push(Event::BlockTip(state, Arc::clone(entry), progress));
    }

    pub fn header_tip(&self, state: SynchronizationState, entry: &Arc<BlockTreeEntry>) {
        self.push(Event::HeaderTip(state, Arc::clone(entry)));
    }

    pub fn progress(&self, title: &str, percent: u8, resume_possible: bool) {
        self.push(Event::Progress(title.to_string(), percent, resume_possible));
    }

    pub fn warning_set(&self, warning: Warning) {
        self.push(Event::WarningSet(warning));
    }

    pub fn warning_unset(&self, warning: Warning) {
        self.push(Event::WarningUnset(warning));
    }

    pub fn flush_error(&self, error: &ConsensusError) {
        self.push(Event::FlushError(error.clone()));
    }

    pub fn fatal_error(&self, error: &ConsensusError) {
        self.push(Event::FatalError(error.clone()));
    }

    pub fn block_checked(&self, block: &Arc<Block>, state: &BlockValidationState) {
        self.push(Event::BlockChecked(Arc::clone(block), state.clone()));
    }

    pub fn pow_valid_block(&self, block: &Arc<Block>, entry: &Arc<BlockTreeEntry>) {
        self.push(Event::PowValidBlock(Arc::clone(block), Arc::clone(entry)));
    }

    pub fn block_connected(&self, block: &Arc<Block>, entry: &Arc<BlockTreeEntry>) {
        self.push(Event::BlockConnected(Arc::clone(block), Arc::clone(entry)));
    }

    pub fn block_disconnected(&self, block: &Arc<Block>, entry: &Arc<BlockTreeEntry>) {
        self.push(Event::BlockDisconnected(Arc::clone(block), Arc::clone(entry)));
    }

    /// Hand every queued event to `subscribers`, oldest first
    ///
    /// Must not be called while the chainstate lock is held.
    pub fn deliver(&self, subscribers: &Subscribers) {
        let _turn = self.delivering.lock();
        loop {
            let next = self.pending.lock().pop_front();
            match next {
                Some(event) => subscribers.dispatch(event),
                None => break,
            }
        }
    }
}
