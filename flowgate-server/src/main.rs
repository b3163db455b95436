use anyhow::Result;
#[cfg(unix)]
use std::sync::Arc;
use tokio::task::JoinSet;

use flowgate_server::config::Config;
use flowgate_server::state::FlowState;
use flowgate_server::transport::{Transport, http::HttpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration from environment variables and CLI arguments
    let config = Config::from_env_and_args()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("flowgate={}", config.log_level).parse()?)
                .add_directive(format!("flowgate_server={}", config.log_level).parse()?),
        )
        .init();

    let state = FlowState::from_config(&config)?;
    tracing::info!(
        "Flow chain loaded with {} controllers, timeout {}s",
        state.chain().len(),
        state.chain().timeout().as_secs()
    );
    match &config.upstream {
        Some(upstream) => tracing::info!("Forwarding admitted requests to {}", upstream),
        None => tracing::info!("No upstream configured, answering admitted requests locally"),
    }

    let mut tasks = JoinSet::new();

    {
        let state = state.clone();
        let host = config.http.host.clone();
        let port = config.http.port;

        tasks.spawn(async move {
            tracing::info!("Starting HTTP transport on {}:{}", host, port);
            let transport = HttpTransport::new(&host, port)?;
            transport.start(state).await
        });
    }

    #[cfg(unix)]
    tasks.spawn(reload_on_hangup(state));

    // Wait for all tasks to complete (they run indefinitely)
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {
                tracing::info!("Task completed successfully");
            }
            Ok(Err(e)) => {
                tracing::error!("Task failed: {}", e);
                return Err(e);
            }
            Err(e) => {
                tracing::error!("Task panicked: {}", e);
                return Err(anyhow::anyhow!("Task panicked"));
            }
        }
    }

    Ok(())
}

/// Re-read the rule file on every SIGHUP
#[cfg(unix)]
async fn reload_on_hangup(state: Arc<FlowState>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    while hangup.recv().await.is_some() {
        match state.reload() {
            Ok(()) => tracing::info!("Rules reloaded, {} controllers", state.chain().len()),
            Err(e) => tracing::warn!("Rule reload failed, keeping current rules: {:#}", e),
        }
    }
    Ok(())
}
