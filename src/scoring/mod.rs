pub mod engine;
pub mod rules;
pub mod tally;

pub use engine::{score_window, violation_breakdown, BreakdownEntry, WindowScore};
pub use rules::{Severity, Violation, ViolationKind};
pub use tally::{Trigger, WindowTally};
