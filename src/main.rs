mod backend;
mod cli;
mod config;
mod errors;
mod executor;
mod index;
mod meta;
mod middleware;
mod model;
mod providers;
mod runner;
#[cfg(test)]
mod scenario_tests;
mod server;
mod skills;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rmcp::ServiceExt;
use rmcp::transport::sse_server::SseServer;
use rmcp::transport::stdio;
use rmcp::transport::streamable_http_server::{
    StreamableHttpService, session::local::LocalSessionManager,
};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Command;
use crate::config::{Config, ServeTransport};
use crate::meta::MetaService;

/// Everything produced by shared initialization, ready for any transport.
pub struct InitializedServer {
    pub meta: Arc<MetaService>,
    pub shutdown: Arc<Notify>,
}

/// Shared initialization: tracing, index, backends, dispatch chain, catalogs.
fn initialize(config: &Config) -> Result<InitializedServer> {
    // Logs go to stderr so the stdio transport stays clean.
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!(backends = config.backends.len(), "metamux starting");

    let index = index::ToolIndex::new();
    let manager = backend::BackendManager::new(config.refresh.clone());
    for settings in &config.backends {
        if let Err(e) = manager.insert_backend(settings) {
            error!(backend = %settings.name, error = %e, "skipping misconfigured backend");
        }
    }

    let providers = providers::ProviderRegistry::new();
    if config.local_tools {
        providers::register_local_tools(&providers, &index);
    }

    let runner = runner::Runner::new(
        Arc::clone(&index),
        Arc::clone(&manager),
        Arc::clone(&providers),
    );
    let (dispatcher, _metrics) =
        middleware::build_dispatcher(config, Arc::clone(&index), runner)?;
    let chains = runner::ChainRunner::new(Arc::clone(&dispatcher));
    let skills = skills::SkillCatalog::new(
        config.toolsets.clone(),
        config.skills.clone(),
        config.skill_limits.clone(),
    );
    let executor = executor::ExecutorBridge::new(Vec::new(), config.executor.clone());

    let meta = Arc::new(MetaService {
        index: Arc::clone(&index),
        manager: Arc::clone(&manager),
        dispatcher,
        chains,
        skills,
        executor,
    });

    // Initial discovery runs in the background so startup never blocks on a
    // slow backend; the catalog fills in as backends connect.
    {
        let manager = Arc::clone(&manager);
        let index = Arc::clone(&index);
        tokio::spawn(async move {
            if let Err(e) = manager.refresh_all(&index, true).await {
                warn!(error = %e, "initial discovery had failures");
            }
            info!(tools = index.tool_count(), "tool discovery complete");
        });
    }

    let shutdown = Arc::new(Notify::new());
    manager.spawn_refresh_loop(Arc::clone(&index), Arc::clone(&shutdown));

    Ok(InitializedServer { meta, shutdown })
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_stdio(init: InitializedServer) -> Result<()> {
    let server = server::MetamuxServer::new(Arc::clone(&init.meta));
    info!("starting MCP stdio server");
    let service = server.serve(stdio()).await?;

    tokio::select! {
        result = service.waiting() => {
            if let Err(e) = result {
                warn!(error = %e, "MCP service exited with error");
            }
        }
        _ = wait_for_signal() => {}
    }

    shutdown(init).await;
    Ok(())
}

async fn run_http(init: InitializedServer, listen: &str) -> Result<()> {
    let meta = Arc::clone(&init.meta);
    let service = StreamableHttpService::new(
        move || Ok(server::MetamuxServer::new(Arc::clone(&meta))),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    let router = axum::Router::new().nest_service("/mcp", service);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;

    info!(listen = %listen, "starting MCP streamable-HTTP server");
    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_signal())
        .await?;

    shutdown(init).await;
    Ok(())
}

async fn run_sse(init: InitializedServer, listen: &str) -> Result<()> {
    let addr = listen
        .parse()
        .with_context(|| format!("invalid listen address {listen}"))?;
    let meta = Arc::clone(&init.meta);

    info!(listen = %listen, "starting MCP SSE server");
    let ct = SseServer::serve(addr)
        .await?
        .with_service(move || server::MetamuxServer::new(Arc::clone(&meta)));

    wait_for_signal().await;
    ct.cancel();

    shutdown(init).await;
    Ok(())
}

async fn shutdown(init: InitializedServer) {
    info!("shutting down");
    init.shutdown.notify_waiters();
    init.meta.manager.shutdown().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let mut config = Config::load(&cli.config)?;

    if let Some(Command::Validate) = &cli.command {
        println!("config ok: {}", cli.config.display());
        return Ok(());
    }

    if let Some(transport) = &cli.transport {
        config.transport = match transport.as_str() {
            "stdio" => ServeTransport::Stdio,
            "sse" => ServeTransport::Sse,
            "http" => ServeTransport::Http,
            other => anyhow::bail!("unknown transport '{other}', expected stdio|sse|http"),
        };
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let listen = config.listen.clone();
    let transport = config.transport;
    let init = initialize(&config)?;

    match transport {
        ServeTransport::Stdio => run_stdio(init).await,
        ServeTransport::Http => run_http(init, &listen).await,
        ServeTransport::Sse => run_sse(init, &listen).await,
    }
}
