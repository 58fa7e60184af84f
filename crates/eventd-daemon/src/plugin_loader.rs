use std::path::Path;
use std::sync::{Arc, Mutex};

use extism::{convert::Json, host_fn, Manifest, Plugin as ExtPlugin, PluginBuilder, UserData, Wasm, PTR};
use serde_json::Value;

use eventd_core::callback::{Callback, CallbackId, CallbackRuntime, Invocation};
use eventd_core::plugin::{LoadOutcome, PluginLoader};
use eventd_core::Event;
use eventd_plugin_sdk::{CallableKind, DispatchOutcome, DispatchRequest, EntityFetchRequest, EntityFetchResult, Registration};

use crate::http_source::EntityLookup;

/// Loads a plugin as a WASM module and hands back its registered callbacks. This is
/// the Rust-native realization of "dynamically loaded shared objects with a fixed
/// ABI": the module is re-instantiated fresh on every reload (mirroring the source
/// language's re-`exec` of the plugin file on mtime change), and a trapping callback
/// surfaces as an ordinary `Err` rather than corrupting the daemon's own memory.
pub struct WasmPluginLoader {
    entity_source: Arc<dyn EntityLookup>,
}

struct HostState {
    plugin_name: String,
    entity_source: Arc<dyn EntityLookup>,
}

impl WasmPluginLoader {
    pub fn new(entity_source: Arc<dyn EntityLookup>) -> Self {
        Self { entity_source }
    }

    fn build_plugin(&self, path: &Path, plugin_name: &str) -> extism::Result<Arc<Mutex<ExtPlugin>>> {
        let state = UserData::new(HostState {
            plugin_name: plugin_name.to_owned(),
            entity_source: self.entity_source.clone(),
        });
        let manifest = Manifest::new([Wasm::file(path)]);
        let plugin = PluginBuilder::new(manifest)
            .with_wasi(true)
            .with_function("log_message", [PTR, PTR], [], state.clone(), log_message)
            .with_function("fetch_event_source_entity", [PTR], [PTR], state.clone(), fetch_event_source_entity)
            .build()?;
        Ok(Arc::new(Mutex::new(plugin)))
    }
}

impl PluginLoader for WasmPluginLoader {
    /// Two distinct failure points, matching the two branches in `LoadOutcome`:
    /// building the module (bad wasm, missing import) is an eval-time failure;
    /// calling `register_callbacks` (missing export, or the export itself traps) is a
    /// registration-time failure. Both quarantine the plugin; neither touches the
    /// daemon.
    fn load(&mut self, path: &Path, plugin_name: &str) -> LoadOutcome {
        let plugin = match self.build_plugin(path, plugin_name) {
            Ok(plugin) => plugin,
            Err(e) => return LoadOutcome::EvalError(e.to_string()),
        };

        let registration = {
            let mut guard = plugin.lock().expect("plugin mutex poisoned");
            guard.call::<(), Json<Registration>>("register_callbacks", ())
        };
        let registration = match registration {
            Ok(Json(registration)) => registration,
            Err(e) => return LoadOutcome::RegistrationError(e.to_string()),
        };

        let mut instance_counts: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
        let callbacks = registration
            .callbacks
            .into_iter()
            .map(|descriptor| {
                let id = match &descriptor.callable_kind {
                    CallableKind::Function => CallbackId::Function { name: descriptor.name.clone() },
                    CallableKind::Instance { class_name } => {
                        let surrogate_id = instance_counts.entry(class_name.clone()).or_insert(0);
                        let id = CallbackId::Instance { class_name: class_name.clone(), surrogate_id: *surrogate_id };
                        *surrogate_id += 1;
                        id
                    }
                };
                Callback::new(
                    id,
                    plugin_name,
                    descriptor.script_name,
                    descriptor.script_key,
                    descriptor.match_filter,
                    descriptor.args,
                    Box::new(WasmCallbackRuntime { plugin: plugin.clone(), callback_name: descriptor.name }),
                )
            })
            .collect();
        LoadOutcome::Callbacks(callbacks)
    }
}

/// Dispatches into the same module instance every callback of a plugin shares;
/// re-entering the module on every event is cheaper than re-instantiating it, and
/// keeps any guest-side static state (e.g. a cached config) alive between events.
struct WasmCallbackRuntime {
    plugin: Arc<Mutex<ExtPlugin>>,
    callback_name: String,
}

impl CallbackRuntime for WasmCallbackRuntime {
    fn invoke(&mut self, event: &Event, args: &Value, session_uuid: Option<&str>) -> Invocation {
        let request = DispatchRequest {
            callback_name: self.callback_name.clone(),
            event: event.clone(),
            args: args.clone(),
            session_uuid: session_uuid.map(str::to_owned),
        };
        let mut guard = self.plugin.lock().expect("plugin mutex poisoned");
        match guard.call::<Json<DispatchRequest>, Json<DispatchOutcome>>("dispatch", Json(request)) {
            Ok(Json(DispatchOutcome::Ok { args })) => Invocation::Ok(args),
            Ok(Json(DispatchOutcome::Err { message, locals })) => Invocation::Err { reason: message, context: locals },
            Err(e) => Invocation::Err { reason: e.to_string(), context: None },
        }
    }
}

host_fn!(log_message(state: HostState; level: u32, msg: String) {
    let state_ref = state.get()?;
    let state = state_ref.lock().expect("poisoned");
    match level {
        1 => log::error!(target: &state.plugin_name, "{msg}"),
        2 => log::warn!(target: &state.plugin_name, "{msg}"),
        3 => log::info!(target: &state.plugin_name, "{msg}"),
        4 => log::debug!(target: &state.plugin_name, "{msg}"),
        _ => log::trace!(target: &state.plugin_name, "{msg}"),
    }
    Ok(())
});

host_fn!(fetch_event_source_entity(state: HostState; req: Json<EntityFetchRequest>) -> Json<EntityFetchResult> {
    let state_ref = state.get()?;
    let state = state_ref.lock().expect("poisoned");
    let result = match state.entity_source.fetch_entity(&req.0.entity_type, req.0.entity_id, &req.0.fields) {
        Ok(value) => EntityFetchResult::Ok(value),
        Err(e) => EntityFetchResult::Err(e.to_string()),
    };
    Ok(Json(result))
});
