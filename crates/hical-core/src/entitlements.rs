//! Premium capability gate.
//!
//! The purchase flow lives outside this crate; services only ask whether the
//! premium capability is currently unlocked.

use std::sync::atomic::{AtomicBool, Ordering};

/// Source of the "premium unlocked" capability.
pub trait Entitlements: Send + Sync {
    fn is_premium(&self) -> bool;
}

/// Entitlement flag flipped by the purchase layer.
#[derive(Debug, Default)]
pub struct PremiumFlag {
    unlocked: AtomicBool,
}

impl PremiumFlag {
    pub fn new(unlocked: bool) -> Self {
        Self {
            unlocked: AtomicBool::new(unlocked),
        }
    }

    pub fn set(&self, unlocked: bool) {
        let previous = self.unlocked.swap(unlocked, Ordering::SeqCst);
        if previous != unlocked {
            tracing::info!(unlocked, "Premium entitlement changed");
        }
    }
}

impl Entitlements for PremiumFlag {
    fn is_premium(&self) -> bool {
        self.unlocked.load(Ordering::SeqCst)
    }
}
