//! Persistent key layout.
//!
//! All durable state lives under these paths:
//!
//! ```text
//! /FrameworkID
//! /ConfigTarget
//! /Configurations/<id>
//! /Tasks/<name>/TaskInfo
//! /Tasks/<name>/TaskStatus
//! /Tasks/<name>/GoalOverrideStatus
//! /Tasks/<name>/Properties/<key>
//! /SchedulerState/Uninstall
//! ```

/// Root of the per-task subtree.
pub const TASKS: &str = "/Tasks";

pub fn framework_id() -> String {
    "/FrameworkID".to_string()
}

pub fn config_target() -> String {
    "/ConfigTarget".to_string()
}

pub fn configurations() -> String {
    "/Configurations".to_string()
}

pub fn configuration(id: &str) -> String {
    format!("/Configurations/{id}")
}

pub fn task(name: &str) -> String {
    format!("{TASKS}/{name}")
}

pub fn task_info(name: &str) -> String {
    format!("{TASKS}/{name}/TaskInfo")
}

pub fn task_status(name: &str) -> String {
    format!("{TASKS}/{name}/TaskStatus")
}

pub fn goal_override(name: &str) -> String {
    format!("{TASKS}/{name}/GoalOverrideStatus")
}

pub fn task_properties(name: &str) -> String {
    format!("{TASKS}/{name}/Properties")
}

pub fn task_property(name: &str, key: &str) -> String {
    format!("{TASKS}/{name}/Properties/{key}")
}

pub fn uninstall_marker() -> String {
    "/SchedulerState/Uninstall".to_string()
}
