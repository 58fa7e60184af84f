//! Reimplementation of the original daemon's `examplePlugins/logArgs.py`: a single
//! unfiltered callback that logs every event it sees. Useful for confirming a
//! plugin path is wired up correctly before writing real business rules.

use extism_pdk::*;

use eventd_plugin_sdk::{CallbackDescriptor, DispatchOutcome, DispatchRequest, Registration};

eventd_plugin_sdk::import_section!();

const SCRIPT_NAME: &str = "$DEMO_SCRIPT_NAME$";
const SCRIPT_KEY: &str = "$DEMO_API_KEY$";

#[plugin_fn]
pub fn register_callbacks() -> FnResult<Json<Registration>> {
    Ok(Json(Registration {
        callbacks: vec![CallbackDescriptor::new("logArgs", SCRIPT_NAME, SCRIPT_KEY)],
        email_policy: None,
    }))
}

#[plugin_fn]
pub fn dispatch(Json(request): Json<DispatchRequest>) -> FnResult<Json<DispatchOutcome>> {
    Logger::info(format!(
        "event {}: type={} attribute={:?} entity={}",
        request.event.id, request.event.event_type, request.event.attribute_name, request.event.entity
    ))?;
    Ok(Json(DispatchOutcome::Ok { args: request.args }))
}
