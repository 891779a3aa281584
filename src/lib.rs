pub mod config;
pub mod grading;
pub mod job;
pub mod sandbox;
pub mod storage;
pub mod submission;
pub mod task_type;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
