//! Startup wiring: build the stores, bus, scheduler, subagent manager, tool
//! registry, and agent loop, then run until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::agent::{AgentComponents, AgentLoop};
use crate::bus::MessageBus;
use crate::channels;
use crate::config::AppConfig;
use crate::providers::OpenAiCompatibleProvider;
use crate::scheduler::Scheduler;
use crate::session::SessionStore;
use crate::skills;
use crate::state::SqliteStore;
use crate::subagents::SubagentManager;
use crate::tools::{ManageScheduleTool, RememberTool, SendMessageTool, SpawnSubagentTool, ToolRegistry};
use crate::traits::ModelProvider;

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    // 1. Stores
    let store = Arc::new(SqliteStore::new(&config.state.db_path).await?);
    let sessions = Arc::new(SessionStore::new(
        store.clone(),
        config.agent.memory_window,
        PathBuf::from(&config.state.workspace_root),
    ));
    sessions.init().await?;

    // 2. Provider
    let provider: Arc<dyn ModelProvider> = Arc::new(OpenAiCompatibleProvider::new(
        &config.provider.base_url,
        &config.provider.api_key,
    )?);
    info!(model = %config.provider.model, "Provider configured");

    // 3. Bus + scheduler
    let bus = Arc::new(MessageBus::new());
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        bus.clone(),
        config.scheduler.max_tasks_per_session,
        config.scheduler.tick_interval_secs,
    ));

    // 4. Tools. Core components reach tools through construction-time
    // injection; per-turn state travels in the execute context.
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(RememberTool::new(store.clone()))).await;
    registry
        .register(Arc::new(SendMessageTool::new(
            bus.clone(),
            sessions.clone(),
            store.clone(),
        )))
        .await;
    registry
        .register(Arc::new(ManageScheduleTool::new(scheduler.clone())))
        .await;

    // 5. Subagents (see the filtered registry view inside the manager)
    let subagents = Arc::new(SubagentManager::new(
        provider.clone(),
        registry.clone(),
        bus.clone(),
        config.subagents.clone(),
        config.provider.model.clone(),
    ));
    if config.subagents.enabled {
        registry
            .register(Arc::new(SpawnSubagentTool::new(subagents.clone())))
            .await;
    }
    info!(tools = registry.len().await, "Tool registry ready");

    // 6. Skills
    let loaded_skills = if config.skills.enabled {
        let dir = PathBuf::from(&config.skills.dir);
        let s = skills::load_skills(&dir);
        info!(count = s.len(), dir = %dir.display(), "Skills loaded");
        s
    } else {
        Vec::new()
    };

    // 7. Agent loop
    let agent = AgentLoop::new(AgentComponents {
        bus: bus.clone(),
        sessions: sessions.clone(),
        users: store.clone(),
        memory: store.clone(),
        spaces: store.clone(),
        provider,
        registry,
        scheduler: scheduler.clone(),
        subagents: subagents.clone(),
        skills: loaded_skills,
        provider_config: config.provider.clone(),
        agent_config: config.agent.clone(),
    });

    scheduler.start().await?;

    let loop_runner = agent.clone();
    let loop_handle = tokio::spawn(async move {
        loop_runner.run().await;
    });

    // 8. Built-in terminal transport
    let terminal_bus = bus.clone();
    tokio::spawn(async move {
        channels::terminal::run(terminal_bus).await;
    });

    info!("switchboard {} running; Ctrl-C to stop", env!("CARGO_PKG_VERSION"));
    tokio::signal::ctrl_c().await?;

    // Shutdown: stop intake and drain the dispatcher first so no new turn
    // can appear after the cancel pass, then cancel turns and await the
    // chains, close the bus, stop subagents and the scheduler, and close the
    // store last.
    info!("Shutting down");
    bus.close_inbound();
    let _ = loop_handle.await;
    agent.shutdown().await;
    bus.close().await;
    subagents.stop_all().await;
    scheduler.stop();
    store.close().await;
    Ok(())
}
