use agentbrokerd::config::{Args, DaemonConfig};
use agentbrokerd::{boundary, index, AppContext};
use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = DaemonConfig::resolve(&args).context("failed to resolve configuration")?;
    let _log_guard = setup_logging(config.log_format_json, config.log_file.as_deref());

    let ctx = AppContext::build(config).context("failed to build application context")?;

    ctx.index.load_or_rebuild().await.context("failed to load session index")?;
    let _sweeper = index::spawn_sweeper(std::sync::Arc::clone(&ctx.index));

    info!(bind_addr = %ctx.config.bind_addr, "agentbrokerd starting");
    if let Err(e) = boundary::run(ctx).await {
        tracing::error!(error = %e, "BoundaryAPI terminated with an error");
        std::process::exit(1);
    }

    Ok(())
}

/// Mirrors the corpus's stdout+rolling-file dual-layer setup, with a JSON
/// layer swapped in when `log_format_json` is set. Falls back to
/// stdout-only if the log directory can't be created rather than panicking.
fn setup_logging(json: bool, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let Some(path) = log_file else {
        if json {
            tracing_subscriber::fmt().with_env_filter(env_filter).json().init();
        } else {
            tracing_subscriber::fmt().with_env_filter(env_filter).compact().init();
        }
        return None;
    };

    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("agentbrokerd.log"));

    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", dir.display());
        tracing_subscriber::fmt().with_env_filter(env_filter).compact().init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();
    }

    Some(guard)
}
