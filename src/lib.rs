#![deny(missing_docs)]
//! # repkv
//! A durable, replicated, multi-threaded key-value store mapping byte-string
//! keys to byte-string values.
//!
//! A single writable master fsyncs every mutation into a write-ahead log,
//! appends it to an append-only data file tracked by an in-memory hash
//! index, and forwards it to read-only replicas either asynchronously
//! (queued) or synchronously (acknowledged before the client sees success).
//! Clients speak a newline-delimited text protocol over TCP.
//!
//! The pieces compose bottom-up: [`store::Wal`], [`store::DataFile`], and
//! [`store::Index`] under [`Store`]'s locking discipline; the
//! [`replication`] module forwards mutations; [`Server`] and [`Client`]
//! speak the wire protocol from [`protocol`].

pub mod config;
pub mod protocol;
pub mod replication;
pub mod store;
pub mod thread_pool;

mod client;
mod error;
mod server;

pub use client::Client;
pub use config::{Config, ReplicationMode};
pub use error::{KvError, Result};
pub use server::Server;
pub use store::{Role, Store};
