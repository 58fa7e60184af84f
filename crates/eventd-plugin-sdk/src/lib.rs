//! Shared types for communication between the event daemon and a plugin, plus the
//! host-call bindings a plugin guest uses to log, fetch source entities, and
//! register itself. Mirrors the split between `artchiver_sdk` and the host-side
//! `sync` crate: this crate carries no host-only logic so it compiles cleanly for
//! both the daemon binary and a `wasm32-wasip1` plugin guest.

pub mod event;
pub mod match_filter;

pub use event::Event;
pub use match_filter::{Attributes, MatchFilter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Distinguishes a plain function registration from a callable-instance
/// registration. The source language let plugins register either; the host uses
/// this to build the matching `CallbackId` (a bare name for a function, or
/// `ClassName_<surrogate-id>` for an instance, assigning the surrogate id from
/// this callback's position among same-class registrations in this plugin).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CallableKind {
    Function,
    Instance { class_name: String },
}

/// One callback a plugin wants registered, as returned from `register_callbacks`.
/// The daemon assigns registration order from the order callbacks appear in this
/// list — it is not re-sorted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallbackDescriptor {
    pub name: String,
    pub script_name: String,
    pub script_key: String,
    #[serde(default)]
    pub match_filter: MatchFilter,
    #[serde(default)]
    pub args: Value,
    #[serde(default = "CallbackDescriptor::default_callable_kind")]
    pub callable_kind: CallableKind,
}

impl CallbackDescriptor {
    pub fn new(name: impl Into<String>, script_name: impl Into<String>, script_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script_name: script_name.into(),
            script_key: script_key.into(),
            match_filter: MatchFilter::new(),
            args: Value::Null,
            callable_kind: Self::default_callable_kind(),
        }
    }

    fn default_callable_kind() -> CallableKind {
        CallableKind::Function
    }

    pub fn with_match_filter(mut self, filter: MatchFilter) -> Self {
        self.match_filter = filter;
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Marks this registration as a callable instance of `class_name` rather than
    /// a plain function, so the host assigns it a `CallbackId::Instance` identity.
    pub fn as_instance(mut self, class_name: impl Into<String>) -> Self {
        self.callable_kind = CallableKind::Instance { class_name: class_name.into() };
        self
    }
}

/// How a plugin wants its CRITICAL-level emails routed. `UseDefault(false)` is the
/// `reg.setEmails(False)` case; `Addresses` overrides the configured recipients.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EmailPolicy {
    UseDefault(bool),
    Addresses(Vec<String>),
}

/// The full return value of `register_callbacks`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Registration {
    pub callbacks: Vec<CallbackDescriptor>,
    #[serde(default)]
    pub email_policy: Option<EmailPolicy>,
}

/// One dispatch of a single callback to a single event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub callback_name: String,
    pub event: Event,
    pub args: Value,
    pub session_uuid: Option<String>,
}

/// The result of a dispatch: either updated `args` to persist, or a failure with an
/// optional diagnostic snapshot (the guest-side analogue of a stack-frame dump) to
/// embed in the CRITICAL email.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DispatchOutcome {
    Ok { args: Value },
    Err { message: String, locals: Option<Value> },
}

/// A read-only query back into the event source entity store, used by
/// business-rule plugins that need to look up fields on the entity an event refers
/// to (e.g. a linked shot's cut-in/cut-out).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityFetchRequest {
    pub entity_type: String,
    pub entity_id: i64,
    pub fields: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EntityFetchResult {
    Ok(Value),
    Err(String),
}

/// Log levels a plugin can report at. Mirrors `log::Level` without forcing guest
/// crates to depend on `log` directly (it isn't `wasm32-wasip1`-friendly to wire a
/// full `Log` implementor inside the sandbox; the host owns the real logger tree).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[repr(u32)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

/// Defines the host-function imports and friendly wrappers a plugin guest uses.
/// Invoke once at crate root in a plugin crate, as `eventd_plugin_sdk::import_section!();`.
#[macro_export]
macro_rules! import_section {
    () => {
        #[extism_pdk::host_fn]
        extern "ExtismHost" {
            fn log_message(level: u32, message: String);
            fn fetch_event_source_entity(
                request: extism_pdk::convert::Json<$crate::EntityFetchRequest>,
            ) -> extism_pdk::convert::Json<$crate::EntityFetchResult>;
        }

        pub struct Logger;
        impl Logger {
            fn emit(level: $crate::LogLevel, message: impl AsRef<str>) -> extism_pdk::FnResult<()> {
                Ok(unsafe { log_message(level as u32, message.as_ref().to_owned()) }?)
            }
            pub fn error(message: impl AsRef<str>) -> extism_pdk::FnResult<()> {
                Self::emit($crate::LogLevel::Error, message)
            }
            pub fn warn(message: impl AsRef<str>) -> extism_pdk::FnResult<()> {
                Self::emit($crate::LogLevel::Warn, message)
            }
            pub fn info(message: impl AsRef<str>) -> extism_pdk::FnResult<()> {
                Self::emit($crate::LogLevel::Info, message)
            }
            pub fn debug(message: impl AsRef<str>) -> extism_pdk::FnResult<()> {
                Self::emit($crate::LogLevel::Debug, message)
            }
        }

        pub struct EventSourceHandle;
        impl EventSourceHandle {
            pub fn fetch_entity(
                entity_type: impl Into<String>,
                entity_id: i64,
                fields: Vec<String>,
            ) -> extism_pdk::FnResult<$crate::EntityFetchResult> {
                let request = $crate::EntityFetchRequest {
                    entity_type: entity_type.into(),
                    entity_id,
                    fields,
                };
                Ok(unsafe { fetch_event_source_entity(extism_pdk::convert::Json(request)) }?.into_inner())
            }
        }
    };
}
