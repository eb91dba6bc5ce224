//! # EventSub Manager
//!
//! A sync-first facade for reference-counted Twitch EventSub sessions.
//!
//! ## Overview
//!
//! Callers attach listeners per account and never touch async code. The first
//! listener for an account opens a session on a background worker thread;
//! detaching the last listener closes it. Every listener of an account shares
//! that account's single upstream connection.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use eventsub_manager::EventSubManager;
//! use eventsub_stream::{AccountConfig, EventKind, FnListener, KindFilter};
//!
//! let manager = EventSubManager::new(Arc::new(my_transport_factory))?;
//! let account = AccountConfig::new("123456", "client-id", "client-secret")
//!     .with_refresh_token("refresh-token");
//!
//! // Only chat messages for this listener
//! let chat = KindFilter::new(
//!     [EventKind::ChannelChatMessage],
//!     FnListener::new(|event, _| {
//!         println!("{}", event.payload);
//!         Ok(())
//!     }),
//! );
//! let id = manager.attach(account.clone(), Arc::new(chat));
//!
//! manager.detach(&account.account_id, id);
//! manager.shutdown()?;
//! ```

pub mod error;
pub mod factory;
pub mod manager;
pub mod worker;

// Re-export main types for convenience
pub use error::{EventManagerError, Result};
pub use factory::{DefaultSessionFactory, SessionFactory};
pub use manager::EventSubManager;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{EventManagerError, EventSubManager, Result, SessionFactory};
    pub use eventsub_stream::{
        AccountConfig, AccountId, EventKind, FnListener, KindFilter, Listener, ListenerId,
        NormalizedEvent, SessionConfig, SessionStatus, StatusLevel,
    };
}
