//! # gigline-store
//!
//! In-memory state for the Gigline inbox: the ordered message sequence of
//! the active conversation, unread counters for the others, and
//! notification read state.
//!
//! Both stores are synchronous. Callers keep them behind a mutex and never
//! hold the lock across an await point, so every mutation is atomic with
//! respect to the event loop.

pub mod conversation;
pub mod models;
pub mod notifications;

mod error;

pub use conversation::ConversationStore;
pub use error::{Result, StoreError};
pub use models::*;
pub use notifications::NotificationStore;
