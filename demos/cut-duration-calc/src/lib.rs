//! Reimplementation of the original daemon's
//! `examplePlugins/calculateCutDuration.py`: recomputes a Shot's cut duration
//! whenever its cut-in or cut-out attribute changes, using the match-filter
//! mechanism to only be dispatched `Shotgun_Shot_Change` events on those two
//! attributes.
//!
//! The plugin ABI only exposes a read-only [`EventSourceHandle::fetch_entity`]
//! query back into the tracker (see SPEC_FULL.md §6) — there is no write-back host
//! function, since authoring business rules and their side effects on the tracker
//! is out of scope for the dispatch engine itself. This demo therefore computes and
//! logs the new duration rather than persisting it, which is enough to exercise the
//! match filter, the entity-lookup round trip, and CRITICAL-worthy failure paths end
//! to end.

use extism_pdk::*;
use serde_json::Value;

use eventd_plugin_sdk::{Attributes, CallbackDescriptor, DispatchOutcome, DispatchRequest, MatchFilter, Registration};

eventd_plugin_sdk::import_section!();

const SCRIPT_NAME: &str = "$DEMO_SCRIPT_NAME$";
const SCRIPT_KEY: &str = "$DEMO_API_KEY$";

#[plugin_fn]
pub fn register_callbacks() -> FnResult<Json<Registration>> {
    let filter = MatchFilter::new().insert(
        "Shotgun_Shot_Change",
        Attributes::Named(["sg_cut_in".to_owned(), "sg_cut_out".to_owned()].into()),
    );
    let callback = CallbackDescriptor::new("calculateCutDuration", SCRIPT_NAME, SCRIPT_KEY).with_match_filter(filter);
    Ok(Json(Registration { callbacks: vec![callback], email_policy: None }))
}

#[plugin_fn]
pub fn dispatch(Json(request): Json<DispatchRequest>) -> FnResult<Json<DispatchOutcome>> {
    let event = &request.event;

    if event.meta.get("new_value").is_none() {
        return Ok(Json(DispatchOutcome::Ok { args: request.args }));
    }

    let Some(shot_id) = event.entity.get("id").and_then(Value::as_i64) else {
        Logger::warn("calculateCutDuration: event entity is missing an integer id")?;
        return Ok(Json(DispatchOutcome::Ok { args: request.args }));
    };

    let fields = vec![
        "code".to_owned(),
        "sg_cut_in".to_owned(),
        "sg_cut_out".to_owned(),
        "sg_cut_duration".to_owned(),
    ];
    let shot = match EventSourceHandle::fetch_entity("Shot", shot_id, fields)? {
        eventd_plugin_sdk::EntityFetchResult::Ok(shot) => shot,
        eventd_plugin_sdk::EntityFetchResult::Err(message) => {
            return Err(Error::msg(format!("failed to look up Shot {shot_id}: {message}")).into());
        }
    };

    let cut_in = shot.get("sg_cut_in").and_then(Value::as_i64);
    let cut_out = shot.get("sg_cut_out").and_then(Value::as_i64);
    let existing_duration = shot.get("sg_cut_duration").and_then(Value::as_i64);

    let new_duration = match (cut_in, cut_out) {
        (Some(cut_in), Some(cut_out)) => Some(cut_out - cut_in + 1),
        _ if existing_duration.is_none() || existing_duration == Some(0) => {
            return Ok(Json(DispatchOutcome::Ok { args: request.args }));
        }
        _ => None,
    };

    let code = shot.get("code").and_then(Value::as_str).unwrap_or("<unknown>");
    Logger::info(format!("{code}: would update Cut Duration to {new_duration:?}"))?;

    Ok(Json(DispatchOutcome::Ok { args: request.args }))
}
