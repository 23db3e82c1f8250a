pub mod flagged_intervals;
pub mod sessions;
pub mod violations;
