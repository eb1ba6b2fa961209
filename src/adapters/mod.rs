//! External datastore adapters

pub mod postgres;

pub use postgres::{apply_payload, PgRosterStore, RosterDatastore, FREE_AGENTS_TEAM};
