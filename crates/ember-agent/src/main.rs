use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::Context;
use ember_supervisor::{
    ConsoleLog, LaunchConfig, LocalExecutable, Severity, Supervisor, TracingSink,
};
use tracing_subscriber::prelude::*;

mod settings;

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (file_layer, guard) = match settings::log_dir() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ember-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    let _guard = init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let chain = settings::format_error_chain(&e);
            tracing::error!(error = %chain, "ember-agent failed");
            eprintln!("ember-agent: {chain}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let settings = settings::AgentSettings::from_env()?;

    let mut builder = LaunchConfig::builder(settings.version)
        .host(settings.host.clone())
        .port(settings.port)
        .stdout_observer(Arc::new(TracingSink::new(Severity::Info, "[mongod std] ")))
        .stderr_observer(Arc::new(TracingSink::new(Severity::Error, "[mongod err] ")));
    if let Some(dir) = &settings.db_path {
        builder = builder.data_dir(dir);
    }
    if let Some(ipv6) = settings.ipv6 {
        builder = builder.ipv6(ipv6);
    }
    if let Some(path) = &settings.console_log {
        let console = Arc::new(ConsoleLog::spawn(path));
        builder = builder
            .stdout_observer(console.clone())
            .stderr_observer(console);
    }
    let config = Arc::new(builder.build().context("build launch configuration")?);

    let supervisor = Supervisor::new(Arc::new(LocalExecutable(settings.mongod_bin.clone())));
    let handle = supervisor
        .launch(config)
        .await
        .with_context(|| format!("launch {}", settings.mongod_bin.display()))?;

    println!(
        "{}",
        serde_json::to_string(&handle.status()).context("encode launch status")?
    );

    tokio::select! {
        reason = shutdown_signal() => {
            tracing::info!(reason, "stopping mongod");
        }
        info = handle.wait_for_exit(Duration::MAX) => {
            tracing::warn!(code = ?info.and_then(|i| i.code), "mongod exited on its own");
        }
    }

    let report = handle.stop().await;
    tracing::info!(?report, "shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "ctrl-c",
                    _ = term.recv() => "sigterm",
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable; waiting for ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                "ctrl-c"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}
