//! Durable state: the SQLite store and its schema migrations.

pub mod migration;
mod store;

pub use store::StateStore;
