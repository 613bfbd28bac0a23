//! Context window accounting.
//!
//! | Module | Role |
//! |--------|------|
//! | [`token`] | Character-based token estimates |
//! | [`usage`] | Usage snapshot of one prospective request |
//! | [`compress`] | Extractive history compression |
//! | [`guard`] | Budget cache, per-chat reply modes, compression ledger |

pub mod compress;
pub mod guard;
pub mod token;
pub mod usage;

pub use compress::{CompressionCandidate, CompressionInput, NotCompressible, Strategy, compress_history};
pub use guard::{
    CompressionLayer, CompressionSummary, ContextGuard, GuardError, GuardSettings, NextReplyMode,
    RequestPlan,
};
pub use token::estimate_tokens;
pub use usage::{UsageInput, UsageSnapshot};
