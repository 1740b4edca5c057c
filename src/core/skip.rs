//! Observation skip resolution
//!
//! Callers may drop individual observations from a problem by listing their
//! indices. Beyond the per-observation flag, an entity (a chessboard frame
//! or a discrete point) whose observations were *all* skipped is marked
//! fully skipped, so downstream consumers can tell "this frame lost one
//! view" apart from "this frame is gone entirely".
//!
//! Observations of the same entity are contiguous in the input (the
//! consistency validator enforces monotonic entity indices before this
//! runs), so full-entity detection is a single forward pass with a
//! retroactive back-fill whenever an entity boundary is crossed.

use crate::core::OrderingError;

/// Skip decision for one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkipFlags {
    /// This observation was individually listed as skipped
    pub skip_observation: bool,
    /// Every observation of this observation's entity was skipped
    pub skip_entity: bool,
}

/// Resolve a skip list against a run of observations
///
/// # Arguments
/// * `kind` - "board" or "point", used in error messages only
/// * `num_observations` - total observation count
/// * `entity_of` - maps an observation index to its entity (frame or point)
/// * `skipped` - strictly increasing observation indices to skip
///
/// # Errors
/// `OrderingError::NotIncreasing` when the list repeats or decreases,
/// `OrderingError::OutOfRange` when an entry is `>= num_observations`. Both
/// name the offending position and values.
pub fn resolve_skips(
    kind: &'static str,
    num_observations: usize,
    entity_of: impl Fn(usize) -> usize,
    skipped: &[usize],
) -> Result<Vec<SkipFlags>, OrderingError> {
    for (position, &value) in skipped.iter().enumerate() {
        if position > 0 && value <= skipped[position - 1] {
            return Err(OrderingError::NotIncreasing {
                kind,
                position,
                got: value,
                previous: skipped[position - 1],
            }
            .log());
        }
        if value >= num_observations {
            return Err(OrderingError::OutOfRange {
                kind,
                position,
                got: value,
                count: num_observations,
            }
            .log());
        }
    }

    let mut flags = vec![SkipFlags::default(); num_observations];
    let mut next_skip = 0usize;

    // First observation index of the entity currently being scanned, and
    // whether every observation of it so far was skipped
    let mut entity_begin = 0usize;
    let mut entity_all_skipped = true;

    for i in 0..num_observations {
        if i > 0 && entity_of(i) != entity_of(i - 1) {
            if entity_all_skipped {
                for flag in &mut flags[entity_begin..i] {
                    flag.skip_entity = true;
                }
            }
            entity_begin = i;
            entity_all_skipped = true;
        }

        if next_skip < skipped.len() && skipped[next_skip] == i {
            next_skip += 1;
            flags[i].skip_observation = true;
        } else {
            entity_all_skipped = false;
        }
    }

    // The final entity has no boundary to trip the back-fill above
    if num_observations > 0 && entity_all_skipped {
        for flag in &mut flags[entity_begin..] {
            flag.skip_entity = true;
        }
    }

    Ok(flags)
}
