//! Per-destination proxy bypass decisions

mod exclusion;

pub use exclusion::{ExclusionList, MatchMode};
