//! Chat conversation and message core
//!
//! Direct and group chats, the message pipeline with its
//! `sent → delivered → read` status machine, per-participant unread counters
//! and realtime fanout on `chat:{id}` / `user:{id}` channels. Storage,
//! moderation, notifications and the user directory are injected as traits.

pub mod config;
pub mod error;
pub mod fanout;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;
pub mod store;

pub use config::{ChatConfig, FanoutConfig, StoreConfig};
pub use error::{AppError, AppResult};
pub use state::{connect_fanout, connect_stores, ChatCore, Collaborators, Stores};
