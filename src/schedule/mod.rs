//! Schedule Runner: cron-driven execution of recurring prompts against
//! project targets.

pub mod runner;
pub mod store;

pub use runner::ScheduleRunner;
pub use store::{
    Execution, ExecutionOutcome, NewSchedule, OverlapBehavior, Schedule, ScheduleStore, SessionBehavior, Target,
};
