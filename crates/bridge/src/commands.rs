//! `serve`, `list` and `export`.

use crate::catalog::{Catalog, ToolListing};
use crate::config::BridgeConfig;
use crate::server::{self, AppState};
use anyhow::Context as _;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serve the HTTP surface until Ctrl-C or SIGTERM. SIGHUP reloads the catalog.
///
/// # Errors
///
/// Returns an error if the documents cannot be loaded, the address cannot be bound, or the
/// server fails.
pub async fn serve(config: &BridgeConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let state = AppState::from_config(config, shutdown.clone()).await?;

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    let addr = listener.local_addr().context("read bound address")?;
    tracing::info!(%addr, tools = state.catalog.current().len(), "MCP bridge listening");

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });
    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(state.clone()));

    server::serve(listener, state).await?;
    tracing::info!("MCP bridge stopped");
    Ok(())
}

/// Print the catalog to stdout.
///
/// # Errors
///
/// Returns an error if any document fails to load.
pub async fn list(config: &BridgeConfig) -> anyhow::Result<()> {
    let catalog = load_catalog(config).await?;
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(render_listing(&catalog).as_bytes())
        .context("write tool listing")?;
    Ok(())
}

/// Write `{"tools": [...]}` to `output` (`-` for stdout).
///
/// # Errors
///
/// Returns an error if any document fails to load or the output cannot be written.
pub async fn export(config: &BridgeConfig, output: &Path) -> anyhow::Result<()> {
    let catalog = load_catalog(config).await?;
    let mut bytes = serde_json::to_vec_pretty(&ToolListing {
        tools: catalog.tools(),
    })
    .context("serialize tool catalog")?;
    bytes.push(b'\n');

    if output.as_os_str() == "-" {
        std::io::stdout()
            .lock()
            .write_all(&bytes)
            .context("write catalog to stdout")?;
    } else {
        tokio::fs::write(output, &bytes)
            .await
            .with_context(|| format!("write {}", output.display()))?;
        tracing::info!(path = %output.display(), tools = catalog.len(), "exported tool catalog");
    }
    Ok(())
}

async fn load_catalog(config: &BridgeConfig) -> anyhow::Result<Catalog> {
    let client = reqwest::Client::new();
    let catalog = Catalog::load(&client, &config.specs, &config.load_options()).await?;
    for e in catalog.errors() {
        tracing::warn!(error = %e, "skipped operation");
    }
    Ok(catalog)
}

/// One block per tool: name, HTTP operation, first description line, parameters.
#[must_use]
pub fn render_listing(catalog: &Catalog) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} tools", catalog.len());
    for tool in catalog.tools() {
        let b = &tool.binding;
        let _ = writeln!(out, "\n{}  {} {}", tool.name, b.method, b.path_template);
        if let Some(line) = tool.description.lines().next().filter(|l| !l.is_empty()) {
            let _ = writeln!(out, "    {line}");
        }
        for (name, _) in &tool.parameters.properties {
            let location = b.param(name).map_or("?", |p| p.location.as_str());
            let marker = if tool.parameters.required.contains(name) {
                " (required)"
            } else {
                ""
            };
            let _ = writeln!(out, "    - {name} [{location}]{marker}");
        }
    }
    if !catalog.errors().is_empty() {
        let _ = writeln!(out, "\n{} operations skipped:", catalog.errors().len());
        for e in catalog.errors() {
            let _ = writeln!(out, "    {e}");
        }
    }
    out
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(unix)]
async fn reload_on_hangup(state: std::sync::Arc<AppState>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to listen for SIGHUP; catalog reload disabled");
            return;
        }
    };
    loop {
        tokio::select! {
            () = state.shutdown.cancelled() => break,
            got = hangup.recv() => {
                if got.is_none() {
                    break;
                }
                tracing::info!("SIGHUP received; reloading catalog");
                if let Err(e) = state.catalog.reload().await {
                    tracing::error!(error = %format!("{e:#}"), "catalog reload failed; keeping the previous catalog");
                }
            }
        }
    }
}
