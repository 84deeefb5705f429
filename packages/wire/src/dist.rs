//! Distribution protocol messages.
//!
//! The message set is versioned: breaking changes add a new version module
//! rather than mutating an existing one, so that an orchestrator can refuse
//! a worker speaking a different version instead of misparsing it.

pub mod v1;
