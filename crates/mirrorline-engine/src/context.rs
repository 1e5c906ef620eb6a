//! Per-run identifiers threaded explicitly through every call.

use mirrorline_types::state::{RunId, SourceId};
use serde_json::{json, Value};

/// Length of a generated run id (prefix of a random UUID).
pub const RUN_ID_LEN: usize = 8;

/// Identifies the run and source an operation belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: RunId,
    pub source_id: SourceId,
}

impl RunContext {
    #[must_use]
    pub fn new(run_id: RunId, source_id: SourceId) -> Self {
        Self { run_id, source_id }
    }

    /// Base event payload; callers extend it with operation details.
    #[must_use]
    pub fn event_data(&self) -> Value {
        json!({
            "run_id": self.run_id.as_str(),
            "source_id": self.source_id.as_str(),
        })
    }

    /// Same payload merged with extra fields.
    #[must_use]
    pub fn event_with(&self, extra: Value) -> Value {
        let mut data = self.event_data();
        if let (Value::Object(base), Value::Object(extra)) = (&mut data, extra) {
            base.extend(extra);
        }
        data
    }
}

/// Fresh run id shared by every source in one invocation.
#[must_use]
pub fn new_run_id() -> RunId {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(RUN_ID_LEN);
    RunId::new(id)
}
