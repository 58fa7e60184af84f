//! Reimplementation of the original daemon's `examplePlugins/sharedStateC.py`: three
//! callable instances of one class share a counter pair. The Python version
//! closes over a shared dict; here the three callbacks are dispatched into the same
//! `extism` module instance (the plugin is re-entered, not re-instantiated, between
//! events — see `WasmPluginLoader`), so ordinary guest-side static state plays the
//! same role without needing the host to alias any per-callback `args` value.
//!
//! Each callback is registered with [`CallbackDescriptor::as_instance`] so the host
//! assigns it a `ClassName_<surrogate-id>` identity instead of a bare function name,
//! exercising the callable-instance naming path end to end.

use std::sync::{Mutex, OnceLock};

use extism_pdk::*;

use eventd_plugin_sdk::{CallbackDescriptor, DispatchOutcome, DispatchRequest, Registration};

eventd_plugin_sdk::import_section!();

const SCRIPT_NAME: &str = "$DEMO_SCRIPT_NAME$";
const SCRIPT_KEY: &str = "$DEMO_API_KEY$";
const CLASS_NAME: &str = "Callback";

/// Internal dispatch names, one per registered instance. `#0` is the instance
/// constructed with `rotate=True` in the original, so it alone resets the
/// rotating counter at the start of each event.
const INSTANCE_NAMES: [&str; 3] = ["Callback#0", "Callback#1", "Callback#2"];

#[derive(Default)]
struct SharedState {
    sequential: i64,
    rotating: i64,
}

static STATE: OnceLock<Mutex<SharedState>> = OnceLock::new();

#[plugin_fn]
pub fn register_callbacks() -> FnResult<Json<Registration>> {
    let callbacks = INSTANCE_NAMES
        .iter()
        .map(|name| CallbackDescriptor::new(*name, SCRIPT_NAME, SCRIPT_KEY).as_instance(CLASS_NAME))
        .collect();
    Ok(Json(Registration { callbacks, email_policy: None }))
}

#[plugin_fn]
pub fn dispatch(Json(request): Json<DispatchRequest>) -> FnResult<Json<DispatchOutcome>> {
    let state = STATE.get_or_init(|| Mutex::new(SharedState::default()));
    let mut state = state.lock().map_err(|_| Error::msg("shared state poisoned"))?;

    if request.callback_name == INSTANCE_NAMES[0] {
        state.rotating = -1;
    }
    state.sequential += 1;
    state.rotating += 1;

    Logger::info(format!("Sequential #{} - Rotating #{}", state.sequential, state.rotating))?;
    Ok(Json(DispatchOutcome::Ok { args: request.args }))
}
