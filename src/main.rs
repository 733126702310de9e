//! ClusterSync - Render cluster controller and renderer
//!
//! Keeps a virtual camera in lock-step across several renderer processes and
//! swaps their buffers together.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use clustersync::config::{self, Config, NetworkConfig};
use clustersync::network::{
    resolve_endpoint, serve, Connection, Controller, ControllerError, Renderer, RendererTarget,
};
use clustersync::protocol::{self, ClusterMsgHandler, Pose, ReadError};

/// ClusterSync - synchronized multi-display rendering
#[derive(Parser)]
#[command(name = "clustersync")]
#[command(author = "ClusterSync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Drive a tiled render cluster from one controller", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as renderer (one tile of the display wall)
    Renderer {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind to
        #[arg(short, long)]
        bind: Option<String>,

        /// Render freely instead of waiting for the swap barrier
        #[arg(long)]
        no_sync: bool,
    },

    /// Run as controller (drives the shared camera)
    Controller {
        /// Renderer address (host or host:port), repeatable; overrides the config file
        #[arg(short, long = "renderer")]
        renderers: Vec<String>,

        /// Stop after this many frames (run until Ctrl+C if unset)
        #[arg(short, long)]
        frames: Option<u64>,

        /// Skip the per-frame swap barrier
        #[arg(long)]
        no_sync: bool,

        /// Leave renderers running when the controller stops
        #[arg(long)]
        keep_renderers: bool,
    },

    /// Send a command string to one renderer
    Command {
        /// Renderer address (host or host:port)
        #[arg(short, long)]
        renderer: String,

        /// Also tell the renderer to exit
        #[arg(long)]
        exit: bool,

        /// Command text
        text: String,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Renderer {
            port,
            bind,
            no_sync,
        } => {
            run_renderer(config, port, bind, !no_sync).await?;
        }
        Commands::Controller {
            renderers,
            frames,
            no_sync,
            keep_renderers,
        } => {
            run_controller(config, renderers, frames, !no_sync, !keep_renderers).await?;
        }
        Commands::Command {
            renderer,
            exit,
            text,
        } => {
            send_command(config, &renderer, &text, exit).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print!("{}", protocol_info(&config.network));
        }
    }

    Ok(())
}

/// Set `cancel` when Ctrl+C arrives
fn cancel_on_ctrl_c(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nShutting down...");
            cancel.store(true, Ordering::SeqCst);
        }
    });
}

/// Run the renderer (server role)
async fn run_renderer(
    config: Config,
    port: Option<u16>,
    bind: Option<String>,
    sync: bool,
) -> anyhow::Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    cancel_on_ctrl_c(cancel.clone());

    let mut renderer_config = config.renderer_config();
    if let Some(port) = port {
        renderer_config.port = port;
    }
    if let Some(bind) = bind {
        renderer_config.bind_address = bind;
    }
    renderer_config.sync = sync;
    renderer_config.read = renderer_config.read.with_cancel(cancel);

    let renderer = Renderer::new(renderer_config);
    let listener = renderer.bind().await?;

    println!("\n========================================");
    println!("  ClusterSync Renderer Running");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Listening: {}", listener.local_addr()?);
    println!("  Mode: {}", if sync { "sync" } else { "free-run" });
    println!("========================================");
    println!("\nWaiting for the controller...");
    println!("Press Ctrl+C to stop.\n");

    let renderer = serve(renderer, listener).await?;
    let scene = renderer.scene();
    tracing::info!(
        "Renderer stopped after {} swaps, {} commands",
        scene.swaps,
        scene.commands.len()
    );

    Ok(())
}

/// Build renderer targets from the command line or the config file
async fn renderer_targets(
    config: &Config,
    endpoints: &[String],
) -> anyhow::Result<Vec<RendererTarget>> {
    let mut targets = Vec::new();

    if endpoints.is_empty() {
        for entry in &config.renderers {
            let addr = resolve_endpoint(&entry.host, entry.port).await?;
            targets.push(RendererTarget {
                name: entry.name.clone(),
                addr,
                offset: entry.offset,
                frustum: entry.frustum,
            });
        }
    } else {
        for endpoint in endpoints {
            let addr = resolve_endpoint(endpoint, config.network.port).await?;
            targets.push(RendererTarget {
                name: endpoint.clone(),
                addr,
                offset: Pose::default(),
                frustum: None,
            });
        }
    }

    if targets.is_empty() {
        anyhow::bail!("No renderers given. Use --renderer or add [[renderers]] to the config.");
    }
    Ok(targets)
}

/// Run the controller (client role)
async fn run_controller(
    config: Config,
    endpoints: Vec<String>,
    frames: Option<u64>,
    sync: bool,
    exit_renderers: bool,
) -> anyhow::Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    cancel_on_ctrl_c(cancel.clone());

    let targets = renderer_targets(&config, &endpoints).await?;

    let mut controller_config = config.controller_config();
    controller_config.sync = sync;
    controller_config.read = controller_config.read.with_cancel(cancel);

    let controller = Controller::connect(controller_config, &targets).await?;

    println!("\n========================================");
    println!("  ClusterSync Controller Connected");
    println!("========================================");
    for target in &targets {
        println!("  {} -> {}", target.name, target.addr);
    }
    println!("  Mode: {}", if sync { "sync" } else { "free-run" });
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    let heading_step = config.sync.heading_step;
    let (controller, result) = tokio::task::spawn_blocking(move || {
        let mut controller = controller;
        let result = controller.run(frames, |frame| {
            Pose::new([0.0, 0.0, 0.0], [(frame as f32 * heading_step) % 360.0, 0.0, 0.0])
        });
        if exit_renderers {
            if let Err(e) = controller.exit() {
                tracing::warn!("Failed to send EXIT: {}", e);
            }
        }
        (controller, result)
    })
    .await?;

    let frames_run = controller.frames();
    controller.close().await;

    match result {
        Ok(_) | Err(ControllerError::Read(ReadError::Cancelled)) => {
            tracing::info!("Controller stopped after {} frames", frames_run);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Send one command string to a renderer
async fn send_command(
    config: Config,
    endpoint: &str,
    text: &str,
    exit: bool,
) -> anyhow::Result<()> {
    let addr = resolve_endpoint(endpoint, config.network.port).await?;
    let timeout = Duration::from_millis(config.network.connect_timeout_ms);
    let connection = Connection::connect(addr, timeout).await?;
    let (_reader, sender, writer) = connection.into_parts();

    let mut handler = ClusterMsgHandler::new(protocol::CONTROLLER_PACKET_START, "command");
    sender.send(handler.make_command_string_datagram(text)?).await?;
    if exit {
        sender.send(handler.make_exit_datagram()).await?;
    }

    drop(sender);
    writer.await?;
    println!("Sent command to {}", addr);

    Ok(())
}

/// Protocol summary with the configured ports
fn protocol_info(network: &NetworkConfig) -> String {
    let mut info = String::new();
    info.push_str("ClusterSync Protocol Information\n");
    info.push_str("================================\n\n");

    info.push_str(&format!(
        "Control port: {} (default {})\n",
        network.port,
        protocol::CLUSTER_SERVER_PORT
    ));
    info.push_str(&format!(
        "Daemon port: {} (default {})\n",
        network.daemon_port,
        protocol::CLUSTER_DAEMON_PORT
    ));
    info.push_str(&format!(
        "Header: {} bytes (u32 sequence, u8 type)\n",
        protocol::HEADER_SIZE
    ));
    info.push_str(&format!(
        "Largest datagram: {} bytes (command text up to {} bytes)\n",
        protocol::MAX_DATAGRAM_SIZE,
        protocol::MAX_COMMAND_LEN
    ));
    info.push_str("Byte order: little-endian\n\n");

    info.push_str("Message types:\n");
    for msg_type in [
        protocol::MessageType::None,
        protocol::MessageType::CamOffset,
        protocol::MessageType::CamFrustum,
        protocol::MessageType::CamMovement,
        protocol::MessageType::SwapReady,
        protocol::MessageType::SwapNow,
        protocol::MessageType::CommandString,
        protocol::MessageType::SelectedMovement,
        protocol::MessageType::Exit,
    ] {
        let payload = match msg_type.payload_len() {
            Some(len) => format!("{} bytes", len),
            None => "u16 length + text".to_string(),
        };
        info.push_str(&format!(
            "  {:>3}  {:<18} {}\n",
            u8::from(msg_type),
            msg_type.name(),
            payload
        ));
    }
    info
}
