//! Per-account session lifecycle
//!
//! [`state`] holds the pure lifecycle transitions; the actor in this module's
//! private `actor` submodule drives them and is reached through
//! [`SessionHandle`].

mod actor;
pub mod state;

pub use actor::SessionHandle;
pub use state::{IllegalTransition, Transition};
