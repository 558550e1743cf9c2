use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::scheduler::{NewTask, Scheduler};
use crate::traits::{Tool, ToolContext};

/// Scheduler control surface exposed to the model. The owning session comes
/// from the execute context, so a task can only manage its own schedule.
pub struct ManageScheduleTool {
    scheduler: Arc<Scheduler>,
}

impl ManageScheduleTool {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[derive(Deserialize)]
struct ScheduleArgs {
    action: String,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
}

#[async_trait]
impl Tool for ManageScheduleTool {
    fn name(&self) -> &str {
        "manage_schedule"
    }

    fn description(&self) -> &str {
        "Manage recurring scheduled tasks for this conversation. Actions: \
         'add' (schedule + description + prompt), 'list', 'remove' (task_id), \
         'enable'/'disable' (task_id). Schedules accept cron expressions \
         ('0 9 * * 1-5') or shortcuts ('hourly', 'every 15m', 'daily at 9am')."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "list", "remove", "enable", "disable"],
                    "description": "What to do"
                },
                "schedule": {
                    "type": "string",
                    "description": "Cron expression or shortcut (for 'add')"
                },
                "description": {
                    "type": "string",
                    "description": "Short human-readable label (for 'add')"
                },
                "prompt": {
                    "type": "string",
                    "description": "The prompt to run on each fire (for 'add')"
                },
                "task_id": {
                    "type": "string",
                    "description": "Task id (for 'remove'/'enable'/'disable')"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let args: ScheduleArgs = serde_json::from_value(args)?;
        match args.action.as_str() {
            "add" => {
                let schedule = args
                    .schedule
                    .ok_or_else(|| anyhow::anyhow!("'add' needs a schedule"))?;
                let description = args
                    .description
                    .ok_or_else(|| anyhow::anyhow!("'add' needs a description"))?;
                let prompt = args
                    .prompt
                    .ok_or_else(|| anyhow::anyhow!("'add' needs a prompt"))?;
                let info = self
                    .scheduler
                    .add_task(NewTask {
                        session_id: ctx.session_id.clone(),
                        channel: ctx.channel.clone(),
                        cron_expression: schedule,
                        description,
                        task_prompt: prompt,
                        creator_user_id: ctx.user_id.clone(),
                    })
                    .await?;
                Ok(format!(
                    "Scheduled task {} ('{}', cron '{}'). Next fire: {}",
                    info.task.id,
                    info.task.description,
                    info.task.cron_expression,
                    info.next_run_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "unknown".to_string()),
                ))
            }
            "list" => {
                let tasks = self.scheduler.get_tasks_by_session(&ctx.session_id).await;
                if tasks.is_empty() {
                    return Ok("No scheduled tasks for this conversation.".to_string());
                }
                let mut out = String::new();
                for info in tasks {
                    out.push_str(&format!(
                        "{} [{}] '{}' cron '{}' runs={} next={}\n",
                        info.task.id,
                        if info.task.enabled { "on" } else { "off" },
                        info.task.description,
                        info.task.cron_expression,
                        info.task.run_count,
                        info.next_run_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string()),
                    ));
                }
                Ok(out)
            }
            "remove" => {
                let id = args
                    .task_id
                    .ok_or_else(|| anyhow::anyhow!("'remove' needs a task_id"))?;
                self.scheduler.remove_task(&id, &ctx.session_id).await?;
                Ok(format!("Removed scheduled task {}", id))
            }
            "enable" | "disable" => {
                let id = args
                    .task_id
                    .ok_or_else(|| anyhow::anyhow!("'{}' needs a task_id", args.action))?;
                let enabled = args.action == "enable";
                self.scheduler
                    .set_task_enabled(&id, &ctx.session_id, enabled)
                    .await?;
                Ok(format!(
                    "Task {} {}",
                    id,
                    if enabled { "enabled" } else { "disabled" }
                ))
            }
            other => anyhow::bail!("Unknown action '{}'", other),
        }
    }
}
