//! The context a chainstate manager runs in
//!
//! A [`Context`] freezes the network parameters, the notification and
//! validation subscribers and the interrupt flag. Managers built from it hold
//! an `Arc<Context>`, which keeps the context alive as long as they are.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::chainparams::{ChainParams, ChainType};
use crate::notifications::{KernelNotifications, Subscribers, ValidationInterface};

/// Builder for [`Context`]
#[derive(Clone, Default)]
pub struct ContextOptions {
    chain_params: Option<ChainParams>,
    subscribers: Subscribers,
}

impl ContextOptions {
    pub fn new() -> Self {
        ContextOptions::default()
    }

    pub fn chain_type(self, chain_type: ChainType) -> Self {
        self.chain_params(ChainParams::new(chain_type))
    }

    pub fn chain_params(mut self, params: ChainParams) -> Self {
        self.chain_params = Some(params);
        self
    }

    pub fn notifications(mut self, notifications: Arc<dyn KernelNotifications>) -> Self {
        self.subscribers.notifications.push(notifications);
        self
    }

    pub fn validation_interface(mut self, interface: Arc<dyn ValidationInterface>) -> Self {
        self.subscribers.validation.push(interface);
        self
    }
}

pub struct Context {
    chain_params: ChainParams,
    subscribers: Subscribers,
    interrupted: AtomicBool,
}

impl Context {
    /// Mainnet unless the options name another network
    pub fn new(options: ContextOptions) -> Arc<Self> {
        let chain_params = options.chain_params.unwrap_or_else(ChainParams::main);
        info!("Using {} chain parameters", chain_params.chain_type);
        Arc::new(Context {
            chain_params,
            subscribers: options.subscribers,
            interrupted: AtomicBool::new(false),
        })
    }

    pub fn chain_params(&self) -> &ChainParams {
        &self.chain_params
    }

    pub(crate) fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    /// Ask long-running operations to stop at their next safe point
    pub fn interrupt(&self) {
        info!("Interrupt requested");
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn reset_interrupt(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }
}
