//! Confidence → action policy.

use crate::config::ThresholdConfig;
use crate::models::Action;

/// Map a confidence score to an action.
///
/// Comparisons are inclusive on the lower bound, so a score sitting exactly on
/// a threshold resolves to the more trusted action. Scores between `block` and
/// `flag` are flagged.
pub fn decide(confidence: f64, cfg: &ThresholdConfig) -> Action {
    if confidence >= cfg.pass {
        Action::Pass
    } else if confidence >= cfg.flag {
        Action::Flag
    } else if confidence < cfg.block {
        Action::Block
    } else {
        Action::Flag
    }
}
