//! The Turn Log (C6): append-only storage for sealed turns, with a read API
//! the session broker's HTTP surface serves retrieval through.

pub mod error;
pub mod turn_log;

pub use error::PersistenceError;
pub use turn_log::{FileTurnLog, TurnLog};
