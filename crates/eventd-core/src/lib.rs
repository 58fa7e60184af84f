//! Dispatch engine for the event daemon.
//!
//! This crate holds the core described as "the hard engineering": the polling
//! loop, per-plugin cursor and backlog bookkeeping, plugin hot-reload, match
//! filtering, crash isolation, connection-retry policy, and durable checkpointing.
//! Daemonization, configuration parsing, and log/email fanout live in the `eventd-daemon`
//! binary crate; the actual WASM plugin runtime lives behind the `PluginLoader` and
//! `CallbackRuntime` traits so this crate can be tested without either.

pub mod callback;
pub mod collection;
pub mod engine;
pub mod error;
pub mod plugin;
pub mod severity;
pub mod source;
pub mod state_store;

pub use callback::{Callback, CallbackId, CallbackRuntime};
pub use collection::PluginCollection;
pub use engine::{Engine, EngineConfig};
pub use error::{EventdError, Result};
pub use eventd_plugin_sdk::event::Event;
pub use eventd_plugin_sdk::match_filter::MatchFilter;
pub use plugin::{Plugin, PluginLoader};
pub use source::{EventSource, FakeEventSource};
pub use state_store::StateStore;
