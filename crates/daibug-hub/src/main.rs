use anyhow::{bail, Context, Result};
use clap::Parser;
use daibug_core::config::{expand_console_alias, Config, WatchRuleSpec};
use daibug_hub::tools::ToolRegistry;
use daibug_hub::Hub;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "daibug")]
#[command(version)]
#[command(about = "Local developer-observability bridge for AI coding agents")]
struct Args {
    /// Dev-server command to run, e.g. "npm run dev"
    #[arg(long)]
    cmd: Option<String>,
    /// Console capture mode: log|debug|warn|error|all|verbose|errors|errors-and-warnings
    #[arg(long)]
    console: Option<String>,
    /// Watch network responses: "<urlGlob>:<csv of status codes>" (repeatable)
    #[arg(long = "watch-network")]
    watch_network: Vec<String>,
    /// Extra sensitive field names, comma separated
    #[arg(long)]
    redact: Option<String>,
    /// Start recording a session immediately
    #[arg(long, default_value_t = false)]
    session_auto_start: bool,
    /// Configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Skip configuration file loading
    #[arg(long, default_value_t = false)]
    no_config: bool,
    /// Also serve the tool registry over stdio (JSON-RPC lines)
    #[arg(long, default_value_t = false)]
    mcp: bool,
}

#[tokio::main]
async fn main() {
    // Keep stdout clean for the stdio tool transport; diagnostics go to
    // stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        error!(event = "fatal", error = %err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let Some(cmd) = args.cmd.clone() else {
        bail!("--cmd is required, e.g. daibug --cmd \"npm run dev\"");
    };

    let config = build_config(&args)?;
    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        bail!("invalid configuration:\n  {}", validation_errors.join("\n  "));
    }

    let hub = Hub::new(config, cmd);
    hub.clone().start().await.context("hub startup failed")?;
    let (http_port, ws_port) = hub.ports().await;
    info!(event = "ready", http_port, ws_port);

    let registry = Arc::new(ToolRegistry::for_hub(hub.clone()));
    let mcp_task = args.mcp.then(|| {
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(err) = daibug_hub::mcp::serve_stdio(registry).await {
                error!(event = "stdio_transport_failed", error = %err);
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(event = "shutdown_signal");

    if let Some(task) = mcp_task {
        task.abort();
    }
    hub.stop().await.context("hub shutdown failed")?;
    Ok(())
}

fn build_config(args: &Args) -> Result<Config> {
    let mut config = match (&args.config, args.no_config) {
        (Some(path), false) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            Config::from_json(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        _ => Config::default(),
    };

    if let Some(mode) = &args.console {
        let include = expand_console_alias(mode);
        if include.is_empty() {
            bail!("unknown console mode: {mode}");
        }
        config.console.include = include;
    }
    for spec in &args.watch_network {
        config.watch.push(parse_watch_network(spec)?);
    }
    if let Some(fields) = &args.redact {
        for field in fields.split(',') {
            let field = field.trim();
            if !field.is_empty() && !config.redact.fields.iter().any(|f| f == field) {
                config.redact.fields.push(field.to_string());
            }
        }
    }
    if args.session_auto_start {
        config.session.auto_start = true;
    }
    Ok(config)
}

/// `"<urlGlob>:<csv of status codes>"` → watch rule.
fn parse_watch_network(spec: &str) -> Result<WatchRuleSpec> {
    let (pattern, codes) = spec
        .rsplit_once(':')
        .with_context(|| format!("--watch-network expects <urlGlob>:<statusCodes>, got {spec:?}"))?;
    if pattern.is_empty() {
        bail!("--watch-network url glob must not be empty");
    }
    let status_codes = codes
        .split(',')
        .map(|code| {
            code.trim()
                .parse::<i64>()
                .with_context(|| format!("bad status code {code:?} in {spec:?}"))
        })
        .collect::<Result<Vec<i64>>>()?;
    if status_codes.is_empty() {
        bail!("--watch-network needs at least one status code");
    }
    Ok(WatchRuleSpec {
        label: format!("network {pattern}"),
        url_pattern: Some(pattern.to_string()),
        status_codes: Some(status_codes),
        ..Default::default()
    })
}
