use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hostbridge::{BridgeConfig, ExportFormat, ExportImage, HostBridge, ScanTextNodes};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "hostbridge", about = "Drive a remote execution host over its websocket relay")]
struct Cli {
    /// Relay server; `localhost` uses plain ws on --port, anything else wss.
    #[arg(long, global = true)]
    server: Option<String>,

    /// Port for a localhost relay.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Config file (default: $XDG_CONFIG_HOME/hostbridge/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Channel to join before running the command.
    #[arg(long, global = true)]
    channel: Option<String>,

    /// Per-command timeout in milliseconds.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send any command and print its JSON result.
    Invoke {
        /// Command name, e.g. get_document_info.
        command: String,
        /// Parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Join a channel and report the host's acknowledgement.
    Join {
        channel: String,
    },
    /// Scan the text nodes under a node, reporting progress as it arrives.
    ScanText {
        node_id: String,
        #[arg(long, default_value_t = 10)]
        chunk_size: usize,
        #[arg(long)]
        no_chunking: bool,
    },
    /// Export a node as an image.
    Export {
        node_id: String,
        /// PNG, JPG, SVG or PDF.
        #[arg(long, default_value = "PNG")]
        format: ExportFormat,
        #[arg(long, default_value_t = 1.0)]
        scale: f64,
        /// Write the decoded image here instead of printing base64.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostbridge=info,hostbridge_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;
    let endpoint = config.endpoint();
    let bridge = HostBridge::new(config);

    bridge.connect();
    bridge
        .wait_connected(CONNECT_TIMEOUT)
        .await
        .with_context(|| format!("could not reach host at {endpoint}"))?;

    let outcome = execute(&bridge, cli).await;
    bridge.shutdown().await;
    outcome
}

fn resolve_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::load(cli.config.as_deref())
        .context("failed to load config")?
        .with_env()
        .apply_server_override(cli.server.clone());
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.command_timeout_ms = timeout_ms;
    }
    Ok(config)
}

async fn execute(bridge: &HostBridge, cli: Cli) -> Result<()> {
    if let Some(channel) = &cli.channel
        && !matches!(cli.command, Command::Join { .. })
    {
        bridge
            .join(channel)
            .await
            .with_context(|| format!("failed to join channel {channel}"))?;
    }

    match cli.command {
        Command::Invoke { command, params } => {
            let params: Value =
                serde_json::from_str(&params).context("--params is not valid JSON")?;
            if !params.is_object() {
                bail!("--params must be a JSON object");
            }
            let result = bridge.invoke(command.as_str(), params).await?;
            print_json(&result)?;
        }
        Command::Join { channel } => {
            let ack = bridge.join(&channel).await?;
            eprintln!("Joined channel {channel}");
            print_json(&ack)?;
        }
        Command::ScanText {
            node_id,
            chunk_size,
            no_chunking,
        } => {
            let mut request = ScanTextNodes::new(node_id).chunk_size(chunk_size);
            if no_chunking {
                request = request.without_chunking();
            }
            let reporter = spawn_progress_reporter(bridge);
            let report = bridge.scan_text_nodes(&request).await;
            reporter.abort();
            let report = report?;
            println!(
                "Scan completed: found {} text nodes, processed {} nodes in {} chunks",
                report.total_nodes, report.processed_nodes, report.chunks
            );
            print_json(&Value::Array(report.text_nodes))?;
        }
        Command::Export {
            node_id,
            format,
            scale,
            out,
        } => {
            let request = ExportImage::new(node_id).format(format).scale(scale);
            let image = bridge.export_image(&request).await?;
            match out {
                Some(path) => {
                    let bytes = image
                        .write_to(&path)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Image saved to {} ({bytes} bytes, {})", path.display(), image.mime_type);
                }
                None => println!("{}", image.image_data),
            }
        }
    }
    Ok(())
}

/// Echo progress updates to stderr while a long command runs.
fn spawn_progress_reporter(bridge: &HostBridge) -> tokio::task::JoinHandle<()> {
    let mut progress = bridge.subscribe_progress();
    tokio::spawn(async move {
        loop {
            match progress.recv().await {
                Ok(event) => {
                    eprintln!("[{:>3}%] {}", event.payload.progress, event.payload.message);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress reporter lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
