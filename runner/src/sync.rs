//! Cross-session coordination through the experiment directory.
//!
//! The exclusive creation of a run's lock file is the only mutual exclusion
//! between sessions, everything else here is bookkeeping around it.

pub mod locking;
pub mod session;
