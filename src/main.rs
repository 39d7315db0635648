use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use npc_learn::broadcast::Broadcaster;
use npc_learn::cognition::{Pipeline, PipelineSettings};
use npc_learn::config::Config;
use npc_learn::llm::{Generative, LlmClient};
use npc_learn::scheduler::TickScheduler;
use npc_learn::server;
use npc_learn::store::{LocalStore, MemoryStore};
use npc_learn::templates::Templates;
use npc_learn::world::World;
use npc_learn::zones::ZoneMap;

/// NPC Learn - town agents that plan, observe and wander, streamed live
#[derive(Parser, Debug)]
#[command(name = "npc-learn", version, about)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address for the HTTP/WebSocket API (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Tick period in seconds (overrides config)
    #[arg(short, long)]
    period: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(args.log_level)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(period) = args.period {
        config.scheduler.period_secs = period.max(1);
    }

    let roster = config.roster();
    info!(
        agents = roster.len(),
        period_secs = config.scheduler.period_secs,
        bind = %config.server.bind,
        "🏘️ NPC Learn starting"
    );

    let store: Arc<dyn MemoryStore> = match &config.store.data_dir {
        Some(dir) => Arc::new(LocalStore::open(dir)?),
        None => Arc::new(LocalStore::ephemeral()),
    };
    let generative: Arc<dyn Generative> = Arc::new(LlmClient::from_env(&config.llm)?);
    let templates = match &config.templates_dir {
        Some(dir) => Templates::load_dir(dir)?,
        None => Templates::builtin(),
    };
    let zones = Arc::new(ZoneMap::town());
    let broadcaster = Arc::new(Broadcaster::new(&config.broadcast));

    let world = Arc::new(World::new(
        roster,
        zones.clone(),
        store.clone(),
        generative.clone(),
        broadcaster,
        config.scheduler.call_timeout(),
    ));
    world.init().await?;

    let pipeline = Pipeline::new(
        store,
        generative,
        zones,
        templates,
        PipelineSettings::from(&config.scheduler),
    );
    let scheduler = TickScheduler::new(
        world.clone(),
        pipeline,
        config.scheduler.period(),
        config.scheduler.event_seed,
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    tokio::select! {
        result = server::serve(world, &config.server.bind) => {
            if let Err(e) = &result {
                error!(error = %e, "api server stopped");
            }
            result?;
        }
        joined = scheduler_task => {
            error!("scheduler task exited unexpectedly");
            return Err(scheduler_exit(joined));
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    Ok(())
}

/// The scheduler loop never returns, so any exit is an error
fn scheduler_exit(joined: Result<(), tokio::task::JoinError>) -> Box<dyn std::error::Error> {
    match joined {
        Ok(()) => "scheduler stopped".into(),
        Err(e) => Box::new(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scheduler_panic_becomes_error() {
        let joined = tokio::spawn(async { panic!("boom") }).await;
        let err = scheduler_exit(joined);
        assert!(err.to_string().contains("panicked"));
    }

    #[test]
    fn test_scheduler_return_becomes_error() {
        assert_eq!(scheduler_exit(Ok(())).to_string(), "scheduler stopped");
    }
}
