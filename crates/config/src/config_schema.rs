//! JSON Schema export for the scheduler config file.

use crate::SchedulerConfig;
use schemars::{Schema, schema_for};

/// JSON Schema for `SchedulerConfig`.
#[must_use]
pub fn scheduler_config_schema() -> Schema {
    schema_for!(SchedulerConfig)
}
