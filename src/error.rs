//! Classified error types callers branch on.
//!
//! Provider-side classification lives in `providers::error`; everything here
//! follows the same hand-rolled `Display` + `Error` shape.

use std::fmt;

use serde_json::Value;

/// Tool registry / execution failures.
#[derive(Debug)]
pub enum ToolError {
    /// No tool registered under this name.
    NotFound(String),
    /// The tool ran and failed. Preserves the name and the exact argument map
    /// so the failure can be replayed.
    Execution {
        tool: String,
        args: Value,
        message: String,
    },
}

impl ToolError {
    pub fn execution(tool: &str, args: &Value, err: &anyhow::Error) -> Self {
        ToolError::Execution {
            tool: tool.to_string(),
            args: args.clone(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "Unknown tool: {}", name),
            ToolError::Execution { tool, message, .. } => {
                write!(f, "Tool '{}' failed: {}", tool, message)
            }
        }
    }
}

impl std::error::Error for ToolError {}

/// Scheduler misuse and validation failures.
#[derive(Debug)]
pub enum SchedulerError {
    /// The cron expression didn't parse. The message lists accepted formats.
    InvalidCron(String),
    /// The session already has the maximum number of enabled tasks.
    QuotaExceeded { limit: usize },
    /// No task with this id in the given session.
    NotFound(String),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::InvalidCron(msg) => write!(f, "{}", msg),
            SchedulerError::QuotaExceeded { limit } => write!(
                f,
                "This session already has {} enabled scheduled tasks. Remove or disable one first.",
                limit
            ),
            SchedulerError::NotFound(id) => write!(f, "No scheduled task '{}' in this session", id),
        }
    }
}

impl std::error::Error for SchedulerError {}

/// Subagent manager misuse and capacity failures.
#[derive(Debug)]
pub enum SubagentError {
    /// The global concurrency cap is exhausted.
    CapacityExceeded { limit: usize },
    NotFound(String),
}

impl fmt::Display for SubagentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubagentError::CapacityExceeded { limit } => write!(
                f,
                "All {} subagent slots are busy. Wait for a running task to finish.",
                limit
            ),
            SubagentError::NotFound(id) => write!(f, "No subagent task '{}'", id),
        }
    }
}

impl std::error::Error for SubagentError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execution_error_preserves_tool_and_args() {
        let err = ToolError::execution(
            "run_command",
            &json!({"cmd": "ls"}),
            &anyhow::anyhow!("exit 1"),
        );
        match &err {
            ToolError::Execution { tool, args, .. } => {
                assert_eq!(tool, "run_command");
                assert_eq!(args["cmd"], "ls");
            }
            other => panic!("unexpected variant: {:?}", other),
        }
        assert!(err.to_string().contains("run_command"));
    }

    #[test]
    fn quota_message_names_the_limit() {
        let err = SchedulerError::QuotaExceeded { limit: 10 };
        assert!(err.to_string().contains("10"));
    }
}
