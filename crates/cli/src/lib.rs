//! Host-side pieces of the `autotrader` binary: the scripted decision source,
//! the JSON-lines decision store and the paper session command.

pub mod commands;
pub mod scripted;
pub mod store;

pub use scripted::ScriptedDecisions;
pub use store::JsonlStore;
