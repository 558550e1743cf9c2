//! `/`-command surface. Commands reply through the normal outbound path and
//! never reach the LLM.

use tracing::warn;

use crate::bus::InboundMessage;

use super::AgentLoop;

const HELP: &str = "\
Commands:
/help — this list
/about — what this assistant is
/clear — forget this conversation's history
/tools — list available tools
/status — session and runtime status
/stop — cancel whatever is currently running for this session
/whoami — show your bound identity
/link — get a code to link another chat app to this identity
/link <code> — redeem a code issued elsewhere
/unlink — detach this chat app into a fresh identity
/space list|create <name>|join <id>|leave <id> — shared spaces";

impl AgentLoop {
    pub(super) async fn handle_command(
        &self,
        msg: &InboundMessage,
        user_id: Option<&str>,
    ) -> String {
        let text = msg.text.trim();
        let mut parts = text.split_whitespace();
        let verb = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        match verb {
            "/help" => HELP.to_string(),
            "/about" => format!(
                "switchboard {} — a multi-channel LLM agent runtime. \
                 Your messages and history stay on this machine.",
                env!("CARGO_PKG_VERSION")
            ),
            "/clear" => match self.sessions.clear_session(&msg.session_id).await {
                Ok(()) => "History cleared. The conversation starts fresh.".to_string(),
                Err(e) => {
                    warn!(session_id = %msg.session_id, error = %e, "Clear failed");
                    format!("\u{274c} Could not clear history: {}", e)
                }
            },
            "/tools" => {
                let tools = self.registry.list_tools().await;
                if tools.is_empty() {
                    "No tools registered.".to_string()
                } else {
                    let mut out = String::from("Available tools:\n");
                    for (name, description) in tools {
                        out.push_str(&format!("- {}: {}\n", name, description));
                    }
                    out
                }
            }
            "/status" => self.status_text(msg).await,
            "/stop" => {
                // Normally intercepted by the dispatcher; arriving here means
                // nothing was running.
                "Nothing to stop.".to_string()
            }
            "/whoami" => match user_id {
                Some(uid) => {
                    let display = match self.users.get_user(uid).await {
                        Ok(Some(u)) => u.display_name.unwrap_or_else(|| "(no name)".to_string()),
                        _ => "(no name)".to_string(),
                    };
                    format!("You are {} (user id {}) on channel {}.", display, uid, msg.channel)
                }
                None => "No identity is bound to this session yet.".to_string(),
            },
            "/link" => self.cmd_link(msg, user_id, &args).await,
            "/unlink" => self.cmd_unlink(msg, user_id).await,
            "/space" => self.cmd_space(user_id, &args).await,
            other => format!(
                "Unknown command '{}'. Try /help for the list of commands.",
                other
            ),
        }
    }

    async fn status_text(&self, msg: &InboundMessage) -> String {
        let message_count = self
            .sessions
            .get_message_count(&msg.session_id)
            .await
            .unwrap_or(0);
        let summary = self
            .sessions
            .get_summary(&msg.session_id)
            .await
            .ok()
            .flatten();
        let scheduled = self.scheduler.get_tasks_by_session(&msg.session_id).await;
        let subagents = self.subagents.tasks_for_session(&msg.session_id).await;

        let mut out = format!(
            "Session {}\n- model: {}\n- messages in window: {}\n",
            msg.session_id, self.provider_config.model, message_count
        );
        if let Some(s) = summary {
            out.push_str(&format!("- compressed history: {} messages\n", s.compressed_count));
        }
        out.push_str(&format!("- scheduled tasks: {}\n", scheduled.len()));
        if !subagents.is_empty() {
            out.push_str("- background tasks:\n");
            for task in subagents {
                out.push_str(&format!("  {} [{}] {}\n", task.id, task.status, task.label));
            }
        }
        out.push_str(&format!("- busy sessions: {}", self.active_sessions()));
        out
    }

    async fn cmd_link(
        &self,
        msg: &InboundMessage,
        user_id: Option<&str>,
        args: &[&str],
    ) -> String {
        match args.first() {
            None => {
                // Issue a code for this identity.
                let Some(uid) = user_id else {
                    return "No identity to link yet — say something first.".to_string();
                };
                match self.users.issue_link_code(uid).await {
                    Ok(code) => format!(
                        "Link code: {}\nSend `/link {}` from another chat app within a few minutes.",
                        code, code
                    ),
                    Err(e) => format!("\u{274c} Could not issue a link code: {}", e),
                }
            }
            Some(code) => {
                let old_user = user_id.map(String::from);
                match self
                    .users
                    .redeem_link_code(code, &msg.channel, &msg.sender)
                    .await
                {
                    Ok(Some(user)) => {
                        self.sessions
                            .set_session_user(&msg.session_id, &user.user_id)
                            .await;
                        if let Some(old) = old_user.filter(|old| old != &user.user_id) {
                            self.sessions.migrate_sessions_user(&old, &user.user_id).await;
                        }
                        format!("Linked. You are now user {} here too.", user.user_id)
                    }
                    Ok(None) => "That code is unknown or expired.".to_string(),
                    Err(e) => format!("\u{274c} Link failed: {}", e),
                }
            }
        }
    }

    async fn cmd_unlink(&self, msg: &InboundMessage, user_id: Option<&str>) -> String {
        if user_id.is_none() {
            return "Nothing to unlink.".to_string();
        }
        match self.users.unlink_identity(&msg.channel, &msg.sender).await {
            Ok(Some(user)) => {
                self.sessions
                    .set_session_user(&msg.session_id, &user.user_id)
                    .await;
                format!("Unlinked. This chat app now has its own identity ({}).", user.user_id)
            }
            Ok(None) => "Nothing to unlink.".to_string(),
            Err(e) => format!("\u{274c} Unlink failed: {}", e),
        }
    }

    async fn cmd_space(&self, user_id: Option<&str>, args: &[&str]) -> String {
        let Some(uid) = user_id else {
            return "Spaces need a bound identity — say something first.".to_string();
        };
        match args.first().copied() {
            Some("list") | None => match self.spaces.spaces_for_user(uid).await {
                Ok(spaces) if spaces.is_empty() => {
                    "You are not in any space. `/space create <name>` starts one.".to_string()
                }
                Ok(spaces) => {
                    let mut out = String::from("Your spaces:\n");
                    for space in spaces {
                        out.push_str(&format!("- {} ({}): {}\n", space.name, space.id, space.description));
                    }
                    out
                }
                Err(e) => format!("\u{274c} {}", e),
            },
            Some("create") => {
                let name = args[1..].join(" ");
                if name.is_empty() {
                    return "Usage: /space create <name>".to_string();
                }
                match self.spaces.create_space(&name, "", uid).await {
                    Ok(space) => format!("Created space '{}' ({}).", space.name, space.id),
                    Err(e) => format!("\u{274c} {}", e),
                }
            }
            Some("join") => match args.get(1) {
                Some(id) => match self.spaces.join_space(id, uid).await {
                    Ok(Some(space)) => format!("Joined '{}'.", space.name),
                    Ok(None) => format!("No space '{}'.", id),
                    Err(e) => format!("\u{274c} {}", e),
                },
                None => "Usage: /space join <id>".to_string(),
            },
            Some("leave") => match args.get(1) {
                Some(id) => match self.spaces.leave_space(id, uid).await {
                    Ok(true) => "Left the space.".to_string(),
                    Ok(false) => format!("You are not in space '{}'.", id),
                    Err(e) => format!("\u{274c} {}", e),
                },
                None => "Usage: /space leave <id>".to_string(),
            },
            Some(other) => format!(
                "Unknown subcommand '{}'. Use /space list|create|join|leave.",
                other
            ),
        }
    }
}
