//! Cron-driven synthetic inbound messages.
//!
//! Tasks live in an in-memory map with a computed next-fire time; a periodic
//! tick publishes due tasks to the bus as inbound messages carrying the task
//! id and creator identity. Fires missed while the process was down are not
//! replayed — `start()` computes the next natural occurrence from now.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::{InboundMessage, MessageBus};
use crate::error::SchedulerError;
use crate::traits::{ScheduledTask, TaskStore};

const CRON_FORMAT_HINT: &str =
    "Expected a 5-field cron expression: minute hour day-of-month month day-of-week \
     (e.g. '0 9 * * 1-5'), or a shortcut like 'hourly', 'every 15m', 'daily at 9am'.";

/// Parameters for `Scheduler::add_task`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub session_id: String,
    pub channel: String,
    pub cron_expression: String,
    pub description: String,
    pub task_prompt: String,
    pub creator_user_id: Option<String>,
}

/// A task plus its computed next fire time.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub task: ScheduledTask,
    pub next_run_at: Option<DateTime<Utc>>,
}

struct TaskSlot {
    task: ScheduledTask,
    next_run_at: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    bus: Arc<MessageBus>,
    max_tasks_per_session: usize,
    tick_interval: Duration,
    tasks: RwLock<HashMap<String, TaskSlot>>,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        bus: Arc<MessageBus>,
        max_tasks_per_session: usize,
        tick_interval_secs: u64,
    ) -> Self {
        Self {
            store,
            bus,
            max_tasks_per_session,
            tick_interval: Duration::from_secs(tick_interval_secs),
            tasks: RwLock::new(HashMap::new()),
            tick_handle: Mutex::new(None),
        }
    }

    /// Load persisted tasks and start the tick loop. Enabled tasks get their
    /// next fire computed from now; missed fires are not replayed.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let persisted = self.store.load_all_tasks().await?;
        let mut tasks = self.tasks.write().await;
        for task in persisted {
            let next_run_at = if task.enabled {
                match compute_next_run(&task.cron_expression) {
                    Ok(next) => Some(next),
                    Err(e) => {
                        error!(task_id = %task.id, error = %e, "Persisted task has unusable cron; left unscheduled");
                        None
                    }
                }
            } else {
                None
            };
            tasks.insert(task.id.clone(), TaskSlot { task, next_run_at });
        }
        info!(tasks = tasks.len(), "Scheduler loaded");
        drop(tasks);

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                scheduler.tick().await;
            }
        });
        *self.tick_handle.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.tick_handle.lock().take() {
            handle.abort();
        }
    }

    /// Fire every enabled task whose next occurrence has passed.
    async fn tick(&self) {
        let now = Utc::now();
        let mut fired: Vec<ScheduledTask> = Vec::new();
        {
            let mut tasks = self.tasks.write().await;
            for slot in tasks.values_mut() {
                if !slot.task.enabled {
                    continue;
                }
                let due = matches!(slot.next_run_at, Some(next) if next <= now);
                if !due {
                    continue;
                }
                slot.task.last_run_at = Some(now);
                slot.task.run_count += 1;
                slot.next_run_at = match compute_next_run(&slot.task.cron_expression) {
                    Ok(next) => Some(next),
                    Err(e) => {
                        error!(task_id = %slot.task.id, error = %e, "Failed to recompute next fire; task disabled");
                        slot.task.enabled = false;
                        None
                    }
                };
                fired.push(slot.task.clone());
            }
        }

        for task in fired {
            if let Err(e) = self.store.save_task(&task).await {
                warn!(task_id = %task.id, error = %e, "Failed to persist task run state");
            }
            info!(task_id = %task.id, session_id = %task.session_id, "Scheduled task fired");
            let mut msg = InboundMessage::new(
                &task.channel,
                &task.session_id,
                "scheduler",
                &format!("[Scheduled task: {}]\n{}", task.description, task.task_prompt),
            )
            .with_metadata("scheduled_task_id", &task.id);
            if let Some(uid) = &task.creator_user_id {
                msg = msg.with_metadata("creator_user_id", uid);
            }
            self.bus.publish_inbound(msg);
        }
    }

    /// Validate, persist, and schedule a new task. Fails with `InvalidCron`
    /// on a bad expression and `QuotaExceeded` when the session is full.
    pub async fn add_task(&self, new: NewTask) -> anyhow::Result<TaskInfo> {
        let cron_expression = parse_schedule(&new.cron_expression)?;
        let next_run_at = compute_next_run(&cron_expression)?;

        let mut tasks = self.tasks.write().await;
        let enabled_in_session = tasks
            .values()
            .filter(|s| s.task.session_id == new.session_id && s.task.enabled)
            .count();
        if enabled_in_session >= self.max_tasks_per_session {
            return Err(SchedulerError::QuotaExceeded {
                limit: self.max_tasks_per_session,
            }
            .into());
        }

        let task = ScheduledTask {
            id: short_id(),
            session_id: new.session_id,
            channel: new.channel,
            cron_expression,
            description: new.description,
            task_prompt: new.task_prompt,
            enabled: true,
            created_at: Utc::now(),
            last_run_at: None,
            run_count: 0,
            creator_user_id: new.creator_user_id,
        };
        self.store.save_task(&task).await?;
        info!(task_id = %task.id, cron = %task.cron_expression, "Scheduled task created");

        tasks.insert(
            task.id.clone(),
            TaskSlot {
                task: task.clone(),
                next_run_at: Some(next_run_at),
            },
        );
        Ok(TaskInfo {
            task,
            next_run_at: Some(next_run_at),
        })
    }

    /// Unschedule and delete. Scope-guarded: the task must belong to
    /// `session_id`.
    pub async fn remove_task(&self, id: &str, session_id: &str) -> anyhow::Result<()> {
        let mut tasks = self.tasks.write().await;
        let owned = tasks
            .get(id)
            .is_some_and(|s| s.task.session_id == session_id);
        if !owned {
            return Err(SchedulerError::NotFound(id.to_string()).into());
        }
        tasks.remove(id);
        drop(tasks);
        self.store.delete_task(id).await?;
        info!(task_id = %id, "Scheduled task removed");
        Ok(())
    }

    /// Start or stop the cron binding. Idempotent.
    pub async fn set_task_enabled(
        &self,
        id: &str,
        session_id: &str,
        enabled: bool,
    ) -> anyhow::Result<()> {
        let mut tasks = self.tasks.write().await;
        let slot = tasks
            .get_mut(id)
            .filter(|s| s.task.session_id == session_id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if slot.task.enabled == enabled {
            return Ok(());
        }
        slot.task.enabled = enabled;
        slot.next_run_at = if enabled {
            Some(compute_next_run(&slot.task.cron_expression)?)
        } else {
            None
        };
        let task = slot.task.clone();
        drop(tasks);
        if let Err(e) = self.store.save_task(&task).await {
            warn!(task_id = %id, error = %e, "Failed to persist task enabled flag");
        }
        Ok(())
    }

    pub async fn get_tasks_by_session(&self, session_id: &str) -> Vec<TaskInfo> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<TaskInfo> = tasks
            .values()
            .filter(|s| s.task.session_id == session_id)
            .map(|s| TaskInfo {
                task: s.task.clone(),
                next_run_at: s.next_run_at,
            })
            .collect();
        out.sort_by(|a, b| a.task.created_at.cmp(&b.task.created_at));
        out
    }

    pub async fn get_task_info(&self, id: &str) -> Option<TaskInfo> {
        let tasks = self.tasks.read().await;
        tasks.get(id).map(|s| TaskInfo {
            task: s.task.clone(),
            next_run_at: s.next_run_at,
        })
    }

    /// Test hook: run one tick now instead of waiting for the interval.
    #[cfg(test)]
    pub async fn tick_now(&self) {
        self.tick().await;
    }

    /// Test hook: force a task due immediately.
    #[cfg(test)]
    pub async fn force_due(&self, id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(slot) = tasks.get_mut(id) {
            slot.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Parse a schedule string into a validated 5-field cron expression.
/// Accepts raw cron plus a few natural shortcuts.
pub fn parse_schedule(input: &str) -> anyhow::Result<String> {
    let input = input.trim();

    match input.to_lowercase().as_str() {
        "hourly" => return Ok("0 * * * *".to_string()),
        "daily" => return Ok("0 0 * * *".to_string()),
        "weekly" => return Ok("0 0 * * 0".to_string()),
        "monthly" => return Ok("0 0 1 * *".to_string()),
        _ => {}
    }

    // "every Nm" / "every N minutes" / "every Nh" / "every N hours"
    let re_every = Regex::new(r"(?i)^every\s+(\d+)\s*(m|min|mins|minutes?|h|hrs?|hours?)$")?;
    if let Some(caps) = re_every.captures(input) {
        let n: u32 = caps[1].parse()?;
        if caps[2].to_lowercase().starts_with('h') {
            if n == 0 || n > 23 {
                return Err(SchedulerError::InvalidCron(format!(
                    "Hours interval must be between 1 and 23, got {}. {}",
                    n, CRON_FORMAT_HINT
                ))
                .into());
            }
            return Ok(format!("0 */{} * * *", n));
        }
        if n == 0 || n > 59 {
            return Err(SchedulerError::InvalidCron(format!(
                "Minutes interval must be between 1 and 59, got {}. {}",
                n, CRON_FORMAT_HINT
            ))
            .into());
        }
        return Ok(format!("*/{} * * * *", n));
    }

    // "daily at 9am" / "daily at 14:30" / "weekdays at 8:30"
    let re_at = Regex::new(r"(?i)^(daily|weekdays?)\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$")?;
    if let Some(caps) = re_at.captures(input) {
        let mut hour: u32 = caps[2].parse()?;
        let minute: u32 = caps.get(3).map_or(Ok(0), |m| m.as_str().parse())?;
        if let Some(ampm) = caps.get(4) {
            match ampm.as_str().to_lowercase().as_str() {
                "pm" if hour < 12 => hour += 12,
                "am" if hour == 12 => hour = 0,
                _ => {}
            }
        }
        if hour > 23 || minute > 59 {
            return Err(SchedulerError::InvalidCron(format!(
                "Time '{}' is out of range. {}",
                input, CRON_FORMAT_HINT
            ))
            .into());
        }
        let dow = if caps[1].to_lowercase().starts_with("weekday") {
            " 1-5"
        } else {
            " *"
        };
        return Ok(format!("{} {} * *{}", minute, hour, dow));
    }

    // Raw cron pass-through, validated
    if input.split_whitespace().count() == 5 {
        input.parse::<Cron>().map_err(|e| {
            SchedulerError::InvalidCron(format!(
                "Invalid cron expression '{}': {}. {}",
                input, e, CRON_FORMAT_HINT
            ))
        })?;
        return Ok(input.to_string());
    }

    Err(SchedulerError::InvalidCron(format!(
        "Unrecognized schedule '{}'. {}",
        input, CRON_FORMAT_HINT
    ))
    .into())
}

/// Next occurrence of a cron expression after now.
pub fn compute_next_run(cron_expression: &str) -> anyhow::Result<DateTime<Utc>> {
    let cron: Cron = cron_expression.parse().map_err(|e| {
        SchedulerError::InvalidCron(format!(
            "Invalid cron expression '{}': {}. {}",
            cron_expression, e, CRON_FORMAT_HINT
        ))
    })?;
    cron.find_next_occurrence(&Utc::now(), false)
        .map_err(|e| anyhow::anyhow!("No next occurrence for '{}': {}", cron_expression, e))
}
