use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Persisted form of one cron trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub job_id: String,
    pub cron: String,
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleJobRequest {
    pub job_id: String,
    pub cron: String,
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl From<ScheduleDefinition> for ScheduleJobRequest {
    fn from(def: ScheduleDefinition) -> Self {
        Self {
            job_id: def.job_id,
            cron: def.cron,
            task_name: def.task_name,
            args: def.args,
            kwargs: def.kwargs,
            timezone: Some(def.timezone),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDescriptor {
    pub job_id: String,
    pub cron: String,
    pub task_name: String,
    pub timezone: String,
    pub next_run_time: Option<DateTime<Utc>>,
}

/// On-disk layout: `{"jobs": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleFile {
    #[serde(default)]
    pub jobs: Vec<ScheduleDefinition>,
}
