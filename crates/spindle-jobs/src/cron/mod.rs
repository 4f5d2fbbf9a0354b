//! Recurring jobs: expression parsing and the persisted registry.

mod expression;
mod registry;

pub use expression::{next_run, CronExpression};
pub use registry::CronRegistry;
