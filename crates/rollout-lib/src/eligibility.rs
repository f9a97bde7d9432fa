//! Which recommendations the engine acts on

use crate::annotations::{is_true, ENABLED};
use crate::models::Recommendation;
use tracing::debug;

/// Update mode under which the recommender only sizes pods at creation,
/// leaving restarts to this controller.
pub const MANAGED_UPDATE_MODE: &str = "initial";

/// True iff the update mode is "Initial" (any case) and the recommendation
/// opted in with `enabled: "true"`. Depends on nothing else.
pub fn is_eligible(rec: &Recommendation) -> bool {
    let mode = rec.update_mode.as_deref().unwrap_or_default();
    if !mode.eq_ignore_ascii_case(MANAGED_UPDATE_MODE) {
        debug!(
            recommendation = %rec.key(),
            update_mode = mode,
            "Skipping recommendation: update mode is not Initial"
        );
        return false;
    }

    if !is_true(rec, ENABLED) {
        debug!(
            recommendation = %rec.key(),
            enabled = rec.annotations.get(ENABLED).map(String::as_str).unwrap_or("<unset>"),
            "Skipping recommendation: rollouts are not enabled"
        );
        return false;
    }

    true
}
