use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use intake::config::{Config, StoreBackend};
use intake::core::credentials;
use intake::core::models::{Permission, Project, ProjectId};
use intake::monitor::Monitor;
use intake::pipeline::Pipeline;
use intake::provision::TestProvisioner;
use intake::runner::ProcessRunner;
use intake::server::Server;
use intake::shutdown;
use intake::state::AppState;
use intake::store::{MemoryStore, RedisStore, Store, StoreError};

#[derive(Debug, Parser)]
#[clap(about = "Submission intake server")]
struct Args {
    /// Configuration file, the embedded defaults are used when absent
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, may be repeated
    #[clap(short, long = "port")]
    ports: Vec<u16>,

    /// Bulk load users from a file of `username:password` lines
    #[clap(long)]
    users: Option<PathBuf>,

    /// Set a user's permission level, `USER:LEVEL` with LEVEL in 0..=7
    #[clap(long, value_parser = parse_access)]
    access: Vec<(String, Permission)>,

    /// Only load users and apply access changes, then exit
    #[clap(long)]
    load_only: bool,
}

fn parse_access(value: &str) -> Result<(String, Permission), String> {
    let (user, level) = value
        .split_once(':')
        .ok_or_else(|| format!("expected USER:LEVEL, got {:?}", value))?;
    let permission = level
        .parse::<u8>()
        .ok()
        .and_then(Permission::from_level)
        .ok_or_else(|| format!("invalid permission level {:?}", level))?;
    Ok((user.to_string(), permission))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("intake=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if !args.ports.is_empty() {
        config.server.ports = args.ports.clone();
    }
    let config = Arc::new(config);

    let store: Arc<dyn Store> = match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.store.redis_url).await?;
            info!("Connected to Redis at {}", config.store.redis_url);
            Arc::new(store)
        }
    };

    if let Some(path) = &args.users {
        load_users(store.as_ref(), path).await?;
    }
    for (user, permission) in &args.access {
        store
            .set_permission(user, *permission)
            .await
            .with_context(|| format!("Failed to set access for {}", user))?;
        info!("User {} now has {} access", user, permission.name());
    }
    if args.load_only {
        return Ok(());
    }

    seed_projects(store.as_ref(), &config).await?;
    std::fs::create_dir_all(&config.base_dir)
        .with_context(|| format!("Failed to create {}", config.base_dir.display()))?;

    let (trigger, shutdown) = shutdown::channel();

    let (monitor, monitor_handle) = Monitor::load(
        config.monitor_path(),
        Duration::from_secs(config.monitor.flush_interval_secs),
    )?;
    let monitor_task = tokio::spawn(monitor.run(shutdown.clone()));

    let provisioner = Arc::new(TestProvisioner::new(store.clone(), config.tests_dir()));
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        Arc::new(ProcessRunner::new()),
        provisioner,
        config.clone(),
    ));
    let (pipeline_handle, _workers) = pipeline.start();

    let app = AppState {
        config: config.clone(),
        store,
        pipeline: pipeline_handle,
        monitor: monitor_handle,
    };

    let mut listeners = Vec::new();
    for port in &config.server.ports {
        let addr = format!("{}:{}", config.server.host, port);
        let server = Server::bind(&addr, app.clone()).await?;
        listeners.push(server.spawn(shutdown.clone()));
    }
    drop(app);

    wait_for_signal().await?;
    info!("Shutting down");
    trigger.trigger();

    for listener in listeners {
        let _ = listener.await;
    }
    match monitor_task.await {
        Ok(active) if !active.is_empty() => {
            warn!("{} submissions were active at shutdown", active.len())
        }
        Ok(_) => info!("No submissions in flight"),
        Err(e) => warn!("Monitor task failed: {}", e),
    }
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn load_users(store: &dyn Store, path: &std::path::Path) -> Result<()> {
    let users = credentials::read_users(path)?;
    let mut added = 0;
    for user in &users {
        match store.add_user(user).await {
            Ok(()) => added += 1,
            Err(StoreError::Duplicate { .. }) => warn!("User {} already exists, skipping", user.name),
            Err(e) => return Err(e).with_context(|| format!("Failed to add user {}", user.name)),
        }
    }
    info!("Loaded {} of {} users from {}", added, users.len(), path.display());
    Ok(())
}

async fn seed_projects(store: &dyn Store, config: &Config) -> Result<()> {
    let existing = store.projects().await?;
    for seed in &config.projects {
        if existing.iter().any(|p| p.name == seed.name) {
            continue;
        }
        let project = Project {
            id: seed.id.unwrap_or_else(ProjectId::new),
            name: seed.name.clone(),
            lang: seed.lang.clone(),
        };
        store.add_project(&project).await?;
        info!("Created project {} ({})", project.name, project.id);
    }
    Ok(())
}
