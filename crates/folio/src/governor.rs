//! Spend ceiling for paid inference calls.
//!
//! The governor never calls anything itself. Callers charge the estimated
//! cost right before each paid request, stop issuing requests once it
//! refuses, and settle the charge with the reported cost afterwards.

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

/// Result of a single charge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Charge {
    pub allowed: bool,
    pub spent: f64,
    pub remaining: f64,
}

#[derive(Debug)]
struct Ledger {
    spent: f64,
    exhausted: bool,
}

/// Spend counter against a fixed ceiling (in USD).
///
/// Once a charge is refused, or settled costs pass the ceiling, the
/// governor stays exhausted: later charges are refused too, even ones that
/// would fit.
#[derive(Debug)]
pub struct CostGovernor {
    ceiling: f64,
    ledger: Mutex<Ledger>,
}

impl CostGovernor {
    pub fn new(ceiling: f64) -> Self {
        Self {
            ceiling: ceiling.max(0.0),
            ledger: Mutex::new(Ledger {
                spent: 0.0,
                exhausted: false,
            }),
        }
    }

    /// A governor that never refuses.
    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY)
    }

    pub fn charge(&self, amount: f64) -> Charge {
        let amount = amount.max(0.0);
        let mut ledger = self.lock();

        if ledger.exhausted || ledger.spent + amount > self.ceiling {
            if !ledger.exhausted {
                tracing::warn!(
                    spent = ledger.spent,
                    amount,
                    ceiling = self.ceiling,
                    "spend ceiling reached"
                );
            }
            ledger.exhausted = true;
            return Charge {
                allowed: false,
                spent: ledger.spent,
                remaining: self.ceiling - ledger.spent,
            };
        }

        ledger.spent += amount;
        Charge {
            allowed: true,
            spent: ledger.spent,
            remaining: self.ceiling - ledger.spent,
        }
    }

    /// Replaces an earlier charge of `estimated` with the `actual` cost the
    /// call reported. An overrun that pushes spend past the ceiling exhausts
    /// the governor; a cheaper call gives the difference back.
    pub fn settle(&self, estimated: f64, actual: f64) -> Charge {
        let delta = actual.max(0.0) - estimated.max(0.0);
        let mut ledger = self.lock();
        ledger.spent = (ledger.spent + delta).max(0.0);
        if ledger.spent > self.ceiling && !ledger.exhausted {
            tracing::warn!(
                spent = ledger.spent,
                ceiling = self.ceiling,
                "reported cost overran the spend ceiling"
            );
            ledger.exhausted = true;
        }
        Charge {
            allowed: !ledger.exhausted,
            spent: ledger.spent,
            remaining: self.ceiling - ledger.spent,
        }
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    pub fn spent(&self) -> f64 {
        self.read(|l| l.spent)
    }

    pub fn remaining(&self) -> f64 {
        self.ceiling - self.spent()
    }

    pub fn is_exhausted(&self) -> bool {
        self.read(|l| l.exhausted)
    }

    fn read<T>(&self, f: impl FnOnce(&Ledger) -> T) -> T {
        f(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
