use serde::{Deserialize, Serialize};
use serde_json::Value;

use eventd_plugin_sdk::event::Event;
use eventd_plugin_sdk::match_filter::MatchFilter;

/// Identity of a registered callback. The source language let plugins register either
/// a plain function or a callable instance; we keep the distinction but replace the
/// non-portable memory address used to disambiguate instances with a surrogate id
/// that is stable for the life of the process (its registration index).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallbackId {
    Function { name: String },
    Instance { class_name: String, surrogate_id: u64 },
}

impl std::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackId::Function { name } => write!(f, "{name}"),
            CallbackId::Instance { class_name, surrogate_id } => {
                write!(f, "{class_name}_{surrogate_id}")
            }
        }
    }
}

/// The outcome of invoking a callback's user code once.
pub enum Invocation {
    /// The call completed; carries the (possibly mutated) opaque `args` value to
    /// persist for the next invocation.
    Ok(Value),
    /// The call raised. `reason` is a human-readable message; `context` is whatever
    /// diagnostic snapshot the runtime captured (e.g. guest-side local state) to embed
    /// in the CRITICAL email, standing in for a pretty-printed stack-frame dump.
    Err { reason: String, context: Option<Value> },
}

/// Abstracts over how a callback's user code actually runs, so the engine can be
/// tested against an in-process closure without loading a real plugin runtime.
pub trait CallbackRuntime {
    fn invoke(&mut self, event: &Event, args: &Value, session_uuid: Option<&str>) -> Invocation;
}

/// A closure-backed runtime for tests and for simple, trusted in-process demo
/// callbacks; `F` never needs to unwind since ordinary `Result` already models
/// "the callback failed".
pub struct FnRuntime<F>(pub F)
where
    F: FnMut(&Event, &Value, Option<&str>) -> std::result::Result<Value, String>;

impl<F> CallbackRuntime for FnRuntime<F>
where
    F: FnMut(&Event, &Value, Option<&str>) -> std::result::Result<Value, String>,
{
    fn invoke(&mut self, event: &Event, args: &Value, session_uuid: Option<&str>) -> Invocation {
        match (self.0)(event, args, session_uuid) {
            Ok(next_args) => Invocation::Ok(next_args),
            Err(reason) => Invocation::Err { reason, context: None },
        }
    }
}

/// One registered handler inside a plugin.
pub struct Callback {
    id: CallbackId,
    script_name: String,
    script_key: String,
    logger_name: String,
    match_filter: MatchFilter,
    args: Value,
    active: bool,
    runtime: Box<dyn CallbackRuntime>,
}

impl Callback {
    pub fn new(
        id: CallbackId,
        plugin_name: &str,
        script_name: impl Into<String>,
        script_key: impl Into<String>,
        match_filter: MatchFilter,
        args: Value,
        runtime: Box<dyn CallbackRuntime>,
    ) -> Self {
        let logger_name = format!("plugin.{plugin_name}.{id}");
        Self {
            id,
            script_name: script_name.into(),
            script_key: script_key.into(),
            logger_name,
            match_filter,
            args,
            active: true,
            runtime,
        }
    }

    pub fn id(&self) -> &CallbackId {
        &self.id
    }

    pub fn logger_name(&self) -> &str {
        &self.logger_name
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn script_key(&self) -> &str {
        &self.script_key
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn can_process(&self, event: &Event) -> bool {
        self.match_filter.admits(event)
    }

    /// Invokes the user callable, guarding against failure and applying the session
    /// uuid if configured. Returns the (possibly newly-false) active flag. A CRITICAL
    /// log line with emailing is the caller's (Plugin's) responsibility, since only it
    /// knows the plugin-level context to attach.
    pub fn process(&mut self, event: &Event, use_session_uuid: bool) -> Result<(), CallbackFailure> {
        if !self.active {
            return Ok(());
        }
        let session_uuid = if use_session_uuid {
            event.session_uuid.as_deref()
        } else {
            None
        };
        match self.runtime.invoke(event, &self.args, session_uuid) {
            Invocation::Ok(next_args) => {
                self.args = next_args;
                Ok(())
            }
            Invocation::Err { reason, context } => {
                self.active = false;
                Err(CallbackFailure {
                    callback: self.id.to_string(),
                    reason,
                    context,
                })
            }
        }
    }
}

#[derive(Debug)]
pub struct CallbackFailure {
    pub callback: String,
    pub reason: String,
    pub context: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_callback(id: CallbackId, filter: MatchFilter) -> Callback {
        Callback::new(
            id,
            "plugin_a",
            "demo",
            "key",
            filter,
            Value::Null,
            Box::new(FnRuntime(|_event, args, _session| Ok(args.clone()))),
        )
    }

    #[test]
    fn logger_name_embeds_plugin_and_callback() {
        let cb = noop_callback(
            CallbackId::Function { name: "onTaskChange".to_owned() },
            MatchFilter::new(),
        );
        assert_eq!(cb.logger_name(), "plugin.plugin_a.onTaskChange");
    }

    #[test]
    fn failure_marks_callback_inactive() {
        let mut cb = Callback::new(
            CallbackId::Function { name: "boom".to_owned() },
            "plugin_a",
            "demo",
            "key",
            MatchFilter::new(),
            Value::Null,
            Box::new(FnRuntime(|_e, _a, _s| Err("kaboom".to_owned()))),
        );
        let event = Event::new(1, "Shotgun_Task_Change");
        assert!(cb.process(&event, false).is_err());
        assert!(!cb.active());
    }

    #[test]
    fn args_mutation_persists_across_invocations() {
        let mut cb = Callback::new(
            CallbackId::Function { name: "counter".to_owned() },
            "plugin_a",
            "demo",
            "key",
            MatchFilter::new(),
            Value::from(0),
            Box::new(FnRuntime(|_e, args, _s| {
                Ok(Value::from(args.as_i64().unwrap_or(0) + 1))
            })),
        );
        let event = Event::new(1, "Any");
        cb.process(&event, false).unwrap();
        cb.process(&event, false).unwrap();
        assert_eq!(cb.args().as_i64(), Some(2));
    }
}
