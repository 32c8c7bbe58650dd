//! Entry point for `udp-duplex`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode, then drives the resulting [`Peer`] from a line-based console.  All
//! protocol work is delegated to the library; `main.rs` owns only process
//! setup (logging, argument parsing), reading files to send, and stdin.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use udp_duplex::packet::MAX_PAYLOAD;
use udp_duplex::socket::Socket;
use udp_duplex::{
    Command, ConfigError, DirectorySink, DuplicatePolicy, Instruction, Peer, Role,
    ServeOutcome, SessionConfig, SessionError, Timeouts, TransferJob,
};

/// Reliable message and file transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    #[command(flatten)]
    opts: Opts,
}

#[derive(Subcommand)]
enum Mode {
    /// Wait for a client; start as the receiver.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
    },
    /// Connect to a server; start as the sender.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
    },
}

#[derive(Args)]
struct Opts {
    /// Payload bytes per fragment.
    #[arg(long, global = true, default_value_t = MAX_PAYLOAD)]
    fragment_size: usize,

    /// Fraction of fragments sent with a deliberately bad checksum (0.0–0.8).
    #[arg(long, global = true, default_value_t = 0.0)]
    error_rate: f64,

    /// Directory received files are written to.
    #[arg(long, global = true, default_value = ".")]
    out_dir: PathBuf,

    /// Seed for the corruption injector (reproducible runs).
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Drop duplicate fragments silently instead of re-acknowledging them.
    #[arg(long, global = true)]
    ignore_duplicates: bool,

    /// Seconds the server waits for a client to connect.
    #[arg(long, global = true, default_value_t = 60)]
    handshake_timeout: u64,

    /// Seconds a receiver tolerates silence before giving up.
    #[arg(long, global = true, default_value_t = 40)]
    idle_timeout: u64,

    /// Seconds the sender waits for each accept/reject.
    #[arg(long, global = true, default_value_t = 15)]
    ack_timeout: u64,

    /// Seconds `listen` waits for an instruction from the peer.
    #[arg(long, global = true, default_value_t = 15)]
    listen_timeout: u64,

    /// Heartbeat deadline unit in seconds.
    #[arg(long, global = true, default_value_t = 5)]
    heartbeat_base: u64,
}

impl Opts {
    /// Reject transfer settings no job could be built with.
    fn validate(&self) -> Result<(), ConfigError> {
        TransferJob::check_limits(self.fragment_size, self.error_rate)
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeouts: Timeouts {
                handshake: Duration::from_secs(self.handshake_timeout),
                receiver_idle: Duration::from_secs(self.idle_timeout),
                ack: Duration::from_secs(self.ack_timeout),
                listen: Duration::from_secs(self.listen_timeout),
                heartbeat_base: Duration::from_secs(self.heartbeat_base),
                ..Timeouts::default()
            },
            duplicate_policy: if self.ignore_duplicates {
                DuplicatePolicy::Ignore
            } else {
                DuplicatePolicy::Reacknowledge
            },
            seed: self.seed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides; protocol progress is logged at info.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    cli.opts
        .validate()
        .context("invalid --fragment-size or --error-rate")?;
    let config = cli.opts.session_config();
    let sink = DirectorySink::new(&cli.opts.out_dir);

    let mut peer = match cli.mode {
        Mode::Server { bind } => {
            let socket = Socket::bind(bind).await.context("binding server socket")?;
            Peer::accept(socket, config, sink).await?
        }
        Mode::Client { server } => {
            let local: SocketAddr = if server.is_ipv4() {
                "0.0.0.0:0".parse()?
            } else {
                "[::]:0".parse()?
            };
            let socket = Socket::bind(local).await.context("binding client socket")?;
            Peer::connect(socket, server, config, sink).await?
        }
    };

    let mut lines = spawn_stdin();
    loop {
        let keep_going = match peer.role() {
            Role::Sender => sender_turn(&mut peer, &mut lines, &cli.opts).await?,
            Role::Receiver => receiver_turn(&mut peer, &mut lines).await?,
        };
        if !keep_going {
            break;
        }
    }
    Ok(())
}

/// Forward stdin lines to a channel so they can be raced against the network.
fn spawn_stdin() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = stdin.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// One console round while holding the sender role.  `Ok(false)` ends the
/// program.
async fn sender_turn(
    peer: &mut Peer<DirectorySink>,
    lines: &mut mpsc::Receiver<String>,
    opts: &Opts,
) -> Result<bool> {
    println!("Choose from: message <text> | file <path> | switch | exit | listen");

    let line = tokio::select! {
        line = lines.recv() => line,
        instruction = peer.wait_for_peer() => {
            return Ok(report_instruction(instruction?));
        }
    };
    let Some(line) = line else {
        peer.terminate().await?;
        return Ok(false);
    };

    let (cmd, arg) = line.trim().split_once(' ').unwrap_or((line.trim(), ""));
    match cmd {
        "message" | "1" => {
            let job = match TransferJob::text_fitted(arg, opts.fragment_size, opts.error_rate) {
                Ok(job) => job,
                Err(e) => {
                    println!("Cannot send message: {e}");
                    return Ok(true);
                }
            };
            if let Some(report) = recoverable(peer.send(&job).await)? {
                println!("Data sent: {} B in {} fragment(s)", report.bytes, report.fragments);
            }
        }
        "file" | "2" => {
            let path = Path::new(arg.trim_matches('"'));
            let job = match read_file_job(path, opts).await {
                Ok(job) => job,
                Err(e) => {
                    println!("Cannot send {}: {e:#}", path.display());
                    return Ok(true);
                }
            };
            if let Some(report) = recoverable(peer.send(&job).await)? {
                println!("Data sent: {} B in {} fragment(s)", report.bytes, report.fragments);
            }
        }
        "switch" | "3" => peer.switch_role().await?,
        "exit" | "4" => {
            peer.terminate().await?;
            return Ok(false);
        }
        "listen" | "5" => return Ok(report_instruction(peer.listen().await?)),
        _ => println!("Invalid input"),
    }
    Ok(true)
}

/// Serve until the role flips or the session ends, relaying console
/// commands to the serving loop.
async fn receiver_turn(
    peer: &mut Peer<DirectorySink>,
    lines: &mut mpsc::Receiver<String>,
) -> Result<bool> {
    println!("Choose from: switch | exit");

    let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
    let serve = peer.serve(&mut cmd_rx);
    tokio::pin!(serve);

    let outcome = loop {
        tokio::select! {
            outcome = &mut serve => break outcome,
            Some(line) = lines.recv() => {
                let cmd = match line.trim() {
                    "switch" | "1" => Command::SwitchRole,
                    "exit" | "2" => Command::Terminate,
                    _ => {
                        println!("Invalid input");
                        continue;
                    }
                };
                // The serve loop owns the receiver half, so this only fails
                // once it has returned.
                let _ = cmd_tx.send(cmd).await;
            }
        }
    };

    // A failed delivery leaves the session idle in the receiver role, so
    // the next turn serves again.
    Ok(match recoverable(outcome)? {
        Some(ServeOutcome::RoleSwitched) | None => true,
        Some(ServeOutcome::Terminated) => false,
    })
}

/// Report errors the session survives and pass the rest up.
fn recoverable<T>(result: Result<T, SessionError>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e @ (SessionError::Config(_) | SessionError::Storage(_))) => {
            println!("{e}");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn report_instruction(instruction: Instruction) -> bool {
    match instruction {
        Instruction::SwitchRole => {
            println!("Peer took over sending; now receiving");
            true
        }
        Instruction::Terminate => {
            println!("Connection terminated");
            false
        }
        Instruction::Nothing => true,
    }
}

async fn read_file_job(path: &Path, opts: &Opts) -> Result<TransferJob> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        bail!("not a file path");
    };
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    println!("Total size of data: {} B", content.len());
    Ok(TransferJob::file_fitted(
        name,
        content,
        opts.fragment_size,
        opts.error_rate,
    )?)
}
