/// chatsync - real-time chat and notification sync for the CRM client
///
/// Keeps a client's view of chat messages and notifications consistent across
/// a push channel, optimistic local sends and a polling fallback.

pub mod api;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod context;
pub mod credentials;
pub mod error;
pub mod notify;
pub mod poller;
pub mod protocol;
pub mod reconcile;
pub mod types;
pub mod view;

pub use client::SyncClient;
pub use config::Config;
pub use error::{Result, SyncError};
pub use view::{SendReceipt, ViewEvent};
