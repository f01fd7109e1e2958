use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use meshbench::config::{LogFormat, PeerConfig, CONFIG_ENV};
use meshbench::proto::{BandwidthSpec, PeerAddress};
use meshbench::{group, orchestrate, saturate};

#[derive(Parser)]
#[command(
    name = "meshbench",
    about = "Peer-to-peer bandwidth measurement and link saturation",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Control listener address, overrides the config file
    #[arg(long, global = true)]
    listen: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a peer: answer bandwidth, saturation and group requests
    Peer {
        /// Directory peer to join a group on
        #[arg(long, requires = "group")]
        join: Option<PeerAddress>,

        /// Group to join
        #[arg(long)]
        group: Option<String>,

        /// Explicit rank in the group
        #[arg(long)]
        rank: Option<u32>,

        /// Leave the mainloop after this many idle seconds (default: run until killed)
        #[arg(long)]
        idle_timeout: Option<u64>,
    },

    /// Host a group, wait for members, run the full bandwidth matrix
    Controller {
        /// Group name
        #[arg(long, default_value = "bw")]
        group: String,

        /// Members to wait for
        #[arg(long)]
        peers: usize,

        /// Seconds to wait for members
        #[arg(long, default_value = "60")]
        wait: u64,

        /// Kill every member when done
        #[arg(long)]
        shutdown: bool,

        #[command(flatten)]
        spec: SpecArgs,
    },

    /// Have one peer measure the bandwidth towards another
    Bw {
        #[arg(long)]
        from: PeerAddress,

        #[arg(long)]
        to: PeerAddress,

        #[command(flatten)]
        spec: SpecArgs,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Start or stop a flood
    Saturate {
        #[command(subcommand)]
        action: SaturateAction,
    },

    /// Query or shut down a group
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// End a peer's mainloop
    Kill {
        #[arg(long)]
        target: PeerAddress,

        /// Wait until the peer has processed the kill
        #[arg(long)]
        sync: bool,
    },
}

#[derive(Subcommand)]
enum SaturateAction {
    /// Order a saturator to flood the path to a target
    Start {
        #[arg(long)]
        saturator: PeerAddress,

        #[arg(long)]
        target: PeerAddress,

        /// Chunk size in bytes (0 = auto-tune from a probe)
        #[arg(long, default_value = "0")]
        message_size: u64,

        /// Seconds to flood (0 = until stopped)
        #[arg(long, default_value = "0")]
        duration: u64,
    },

    /// Stop a flood and print its report
    Stop {
        #[arg(long)]
        saturator: PeerAddress,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum GroupAction {
    /// Print the members of a group
    Get {
        #[arg(long)]
        directory: PeerAddress,

        #[arg(long)]
        name: String,
    },

    /// Kill every member of a group and delete it
    Shutdown {
        #[arg(long)]
        directory: PeerAddress,

        #[arg(long)]
        name: String,
    },
}

#[derive(Args)]
struct SpecArgs {
    /// Socket buffer size (0 = OS default)
    #[arg(long, default_value = "0")]
    buffer_size: u32,

    /// Bytes per message
    #[arg(long, default_value = "524288")]
    message_size: u64,

    /// Messages per round
    #[arg(long, default_value = "1")]
    message_count: u32,

    /// Rounds shorter than this are re-run with bigger messages
    #[arg(long, default_value = "1000")]
    min_duration_ms: u64,
}

impl From<&SpecArgs> for BandwidthSpec {
    fn from(args: &SpecArgs) -> Self {
        BandwidthSpec {
            buffer_size: args.buffer_size,
            message_size: args.message_size,
            message_count: args.message_count,
            min_duration_ms: args.min_duration_ms,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PeerConfig::load(path)?,
        None => PeerConfig::load_or_default(),
    };
    init_tracing(config.logging.format);

    let serving = matches!(cli.command, Commands::Peer { .. } | Commands::Controller { .. });
    match cli.listen {
        Some(listen) => config.network.listen_address = listen,
        // One-shot commands only need a reply path, not the well-known port.
        None if !serving => config.network.listen_address = "0.0.0.0:0".to_string(),
        None => {}
    }

    match cli.command {
        Commands::Peer {
            join,
            group: group_name,
            rank,
            idle_timeout,
        } => {
            let mut peer = meshbench::bind_peer(config).await?;
            if let (Some(directory), Some(name)) = (join, group_name) {
                let socket = peer.connect(&directory).await?;
                let joined = group::join(&peer, &socket, &name, rank).await;
                socket.close().await;
                let rank = joined?;
                tracing::info!(group = %name, %directory, rank, "joined group");
            }
            meshbench::serve(&mut peer, idle_timeout.map(Duration::from_secs)).await?;
        }
        Commands::Controller {
            group: name,
            peers,
            wait,
            shutdown,
            spec,
        } => {
            let mut peer = meshbench::bind_peer(config).await?;
            group::create_group(&mut peer, &name)?;
            println!("Waiting for {} peers on {} (group '{}')", peers, peer.address(), name);
            let snapshot =
                group::await_members(&mut peer, &name, peers, Duration::from_secs(wait)).await?;
            let hosts = snapshot.addresses();
            let matrix = orchestrate::matrix(&peer, &hosts, BandwidthSpec::from(&spec)).await?;

            println!("\n=== Bandwidth matrix (MB/s) ===");
            print!("{:<22}", "from \\ to");
            for to in &hosts {
                print!(" | {:>22}", to.to_string());
            }
            println!();
            for (from, row) in hosts.iter().zip(&matrix) {
                print!("{:<22}", from.to_string());
                for cell in row {
                    match cell {
                        Some(r) => print!(" | {:>22.2}", r.bytes_per_second / 1e6),
                        None => print!(" | {:>22}", "-"),
                    }
                }
                println!();
            }

            if shutdown {
                group::shutdown_local(&mut peer, &name).await?;
                println!("Group '{}' shut down.", name);
            }
        }
        Commands::Bw { from, to, spec, json } => {
            let peer = meshbench::bind_peer(config).await?;
            let result =
                orchestrate::pairwise(&peer, &from, &to, BandwidthSpec::from(&spec)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "{} -> {}: {:.2} MB/s ({:.3} s)",
                    from,
                    to,
                    result.bytes_per_second / 1e6,
                    result.elapsed_seconds
                );
            }
        }
        Commands::Saturate { action } => {
            let peer = meshbench::bind_peer(config).await?;
            match action {
                SaturateAction::Start {
                    saturator,
                    target,
                    message_size,
                    duration,
                } => {
                    saturate::saturate_start(&peer, &saturator, &target, message_size, duration)
                        .await?;
                    println!("{} is flooding {}.", saturator, target);
                }
                SaturateAction::Stop { saturator, json } => {
                    let timeout = peer.config().timeouts.stop();
                    let report = saturate::saturate_stop(&peer, &saturator, timeout).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    } else {
                        println!(
                            "{}: {} bytes in {:.3} s ({:.2} MB/s)",
                            saturator,
                            report.bytes_sent,
                            report.elapsed_seconds,
                            report.bytes_per_second / 1e6
                        );
                    }
                }
            }
        }
        Commands::Group { action } => {
            let peer = meshbench::bind_peer(config).await?;
            match action {
                GroupAction::Get { directory, name } => {
                    let socket = peer.connect(&directory).await?;
                    let snapshot = group::get(&peer, &socket, &name).await;
                    socket.close().await;
                    let snapshot = snapshot?;
                    if snapshot.members.is_empty() {
                        println!("Group '{}' has no members.", name);
                    } else {
                        println!("{:<6} | Address", "Rank");
                        println!("{:-<6}-|-{:-<30}", "", "");
                        for member in &snapshot.members {
                            println!("{:<6} | {}", member.rank, member.address);
                        }
                    }
                }
                GroupAction::Shutdown { directory, name } => {
                    let socket = peer.connect(&directory).await?;
                    let done = group::shutdown(&peer, &socket, &name).await;
                    socket.close().await;
                    done?;
                    println!("Group '{}' shut down.", name);
                }
            }
        }
        Commands::Kill { target, sync } => {
            let peer = meshbench::bind_peer(config).await?;
            if sync {
                group::kill_sync(&peer, &target).await
            } else {
                group::kill(&peer, &target).await
            }
            .with_context(|| format!("failed to kill {target}"))?;
            println!("Killed {}.", target);
        }
    }

    Ok(())
}
