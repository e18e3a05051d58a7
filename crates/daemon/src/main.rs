//! ptymux
//!
//! Terminal session multiplexer: daemon and command line client.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ptymux_daemon::config::Config;
use ptymux_daemon::ipc::{pidfile, IpcClient, IpcRequest, IpcResponse};
use ptymux_daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use ptymux_daemon::protocol::{now_millis, SessionCreate, SessionStatus, TerminalMessage};
use ptymux_daemon::session::SessionSummary;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Byte that detaches an interactive attach (Ctrl-]).
const DETACH_KEY: u8 = 0x1d;

/// Timeout for connecting to the daemon socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// ptymux - run programs in detachable terminal sessions.
#[derive(Parser, Debug)]
#[command(name = "ptymux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the ptymux daemon in the foreground
    Start {
        /// Write logs to hourly rolling files in the configured log directory
        #[arg(long)]
        log_file: bool,
    },

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Attach the terminal to a session (Ctrl-] detaches)
    Attach {
        /// Session ID to attach to
        session_id: String,
    },
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all sessions that are not closed
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start a new session
    Create {
        /// Working directory for the program
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,

        /// Environment variable for the program (repeatable)
        #[arg(long, short, value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Terminal columns
        #[arg(long, default_value = "80")]
        cols: u16,

        /// Terminal rows
        #[arg(long, default_value = "24")]
        rows: u16,

        /// Attach to the session right after creating it
        #[arg(long, short)]
        attach: bool,

        /// Program and arguments (default: the configured shell)
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Terminate a session
    Kill {
        /// Session ID to kill
        session_id: String,

        /// Signal to send (default: SIGHUP, escalating to SIGKILL)
        /// Common values: SIGHUP (1), SIGTERM (15), SIGKILL (9)
        #[arg(long, short, default_value = "SIGHUP")]
        signal: String,

        /// Force kill (equivalent to --signal SIGKILL)
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let log_dir = match &cli.command {
        Commands::Start { log_file: true } => Some(config.daemon.log_dir.clone()),
        _ => None,
    };
    let _log_guard = ptymux_daemon::logging::init(
        &config.daemon.log_level,
        cli.verbose,
        log_dir.as_deref(),
    )?;

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    let socket_path = config.socket_path();
    let pid_path = pidfile::pid_file_in(&config.daemon.data_dir);

    match cli.command {
        Commands::Start { .. } => {
            if let Some(pid) = pidfile::read_daemon_pid(&pid_path) {
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  ptymux stop");
                std::process::exit(1);
            }

            tracing::info!("ptymux daemon starting...");
            let orchestrator = DaemonOrchestrator::new(config)?;
            run_headless(&orchestrator).await?;
        }
        Commands::Stop { force, timeout } => {
            tracing::info!("Stopping daemon (force: {})", force);

            let result = if force {
                force_stop_daemon(&pid_path, &socket_path)
            } else {
                graceful_stop_daemon(&socket_path, timeout).await
            };
            match result {
                Ok(()) => println!("Daemon stopped successfully"),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {:#}", e);
                    if !force {
                        eprintln!("Try: ptymux stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => match query_daemon_status(&socket_path).await {
            Ok(IpcResponse::Status {
                running,
                pid,
                uptime_secs,
                session_count,
                subscriber_count,
            }) => {
                println!(
                    "Daemon Status: {}",
                    if running { "running" } else { "stopped" }
                );
                println!("  PID:         {}", pid);
                println!("  Uptime:      {}", format_duration(uptime_secs));
                println!("  Sessions:    {}", session_count);
                println!("  Subscribers: {}", subscriber_count);
                println!("  Socket:      {}", socket_path.display());
            }
            Ok(other) => anyhow::bail!("Unexpected response from daemon: {:?}", other),
            Err(_) => {
                println!("Daemon Status: stopped");
                if let Some(pid) = pidfile::read_daemon_pid(&pid_path) {
                    println!("  (process {} is alive but not answering)", pid);
                }
                std::process::exit(1);
            }
        },
        Commands::Sessions(SessionsCommands::List { json }) => {
            let mut client = connect(&socket_path).await?;
            let sessions = client
                .list_sessions()
                .await
                .context("Failed to query sessions")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions_table(&sessions);
            }
        }
        Commands::Sessions(SessionsCommands::Create {
            cwd,
            env,
            cols,
            rows,
            attach,
            command,
        }) => {
            let mut env_pairs = Vec::with_capacity(env.len());
            for entry in &env {
                env_pairs.push(parse_env(entry)?);
            }

            let mut command = command.into_iter();
            let request = SessionCreate {
                command: command.next(),
                args: command.collect(),
                cwd: cwd.map(|p| p.to_string_lossy().into_owned()),
                env: env_pairs,
                cols,
                rows,
            };

            let mut client = connect(&socket_path).await?;
            let created = client.create_session(request).await?;

            if attach {
                let code = attach_session(client, &created.session_id).await?;
                std::process::exit(code);
            }

            println!("{}", created.session_id);
            if let Some(pid) = created.pid {
                tracing::info!(session_id = %created.session_id, pid, "Session created");
            }
        }
        Commands::Sessions(SessionsCommands::Kill {
            session_id,
            signal,
            force,
        }) => {
            let signal_num = if force { 9 } else { parse_signal(&signal)? };
            let mut client = connect(&socket_path).await?;

            match client.kill_session(&session_id, Some(signal_num)).await? {
                IpcResponse::SessionKilled { .. } => {
                    println!("Sent signal {} to session {}", signal_num, session_id);
                }
                IpcResponse::Error { message, .. } => {
                    eprintln!("Failed to kill session: {}", message);
                    std::process::exit(1);
                }
                other => anyhow::bail!("Unexpected response from daemon: {:?}", other),
            }
        }
        Commands::Attach { session_id } => {
            let client = connect(&socket_path).await?;
            let code = attach_session(client, &session_id).await?;
            // Stdin is read on a blocking thread the runtime cannot cancel.
            std::process::exit(code);
        }
    }

    Ok(())
}

/// Connects to the daemon socket.
async fn connect(socket_path: &Path) -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(socket_path, CONNECT_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Parse a signal string into a signal number.
///
/// Accepts:
/// - Numeric signals: "9", "15"
/// - Named signals: "SIGTERM", "SIGKILL", "TERM", "KILL"
fn parse_signal(signal_str: &str) -> anyhow::Result<i32> {
    if let Ok(num) = signal_str.parse::<i32>() {
        if num > 0 && num < 32 {
            return Ok(num);
        }
        anyhow::bail!("Invalid signal number: {} (must be 1-31)", num);
    }

    let name = signal_str.to_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);

    match name {
        "HUP" => Ok(1),
        "INT" => Ok(2),
        "QUIT" => Ok(3),
        "KILL" => Ok(9),
        "TERM" => Ok(15),
        "USR1" => Ok(10),
        "USR2" => Ok(12),
        _ => anyhow::bail!("Unknown signal: {}", signal_str),
    }
}

/// Parse a `KEY=VALUE` environment assignment.
fn parse_env(entry: &str) -> anyhow::Result<(String, String)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => anyhow::bail!("Invalid environment variable (expected KEY=VALUE): {}", entry),
    }
}

/// Query the daemon status via IPC.
async fn query_daemon_status(socket_path: &Path) -> anyhow::Result<IpcResponse> {
    let mut client = connect(socket_path).await?;
    match client.status().await.context("Failed to query status")? {
        IpcResponse::Error { message, .. } => anyhow::bail!("Daemon returned error: {}", message),
        response => Ok(response),
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.id.len())
        .max()
        .unwrap_or(8)
        .max(8);
    let command_width = 32;

    println!(
        "{:<id_width$}  {:>7}  {:<8}  {:>4}  {:>10}  {:<command_width$}",
        "ID",
        "PID",
        "STATE",
        "SUBS",
        "ACTIVE",
        "COMMAND",
        id_width = id_width,
        command_width = command_width
    );
    println!("{}", "-".repeat(id_width + command_width + 41));

    for session in sessions {
        let pid = session
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<id_width$}  {:>7}  {:<8}  {:>4}  {:>10}  {:<command_width$}",
            session.id,
            pid,
            session.state.to_string(),
            session.subscribers,
            format_relative_time(session.last_activity_at),
            truncate_str(&session.command, command_width),
            id_width = id_width,
            command_width = command_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix millisecond timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp_ms: u64) -> String {
    let elapsed = now_millis().saturating_sub(timestamp_ms) / 1000;

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum number of characters, adding "..." if
/// truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Gracefully stop the daemon via IPC.
///
/// Sends a shutdown request and waits for the socket to disappear.
async fn graceful_stop_daemon(socket_path: &Path, timeout_secs: u64) -> anyhow::Result<()> {
    let mut client = connect(socket_path).await?;

    println!("Sending shutdown request...");

    client.set_timeout(Duration::from_secs(timeout_secs));
    match client.stop().await.context("Failed to send stop request")? {
        IpcResponse::Stopping => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        IpcResponse::Error { message, .. } => {
            anyhow::bail!("Daemon returned error: {}", message);
        }
        other => {
            anyhow::bail!("Unexpected response from daemon: {:?}", other);
        }
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Force stop the daemon using SIGKILL.
///
/// Reads the daemon PID from the PID file and sends SIGKILL. Sessions started
/// by the daemon lose their controlling terminal and receive SIGHUP.
fn force_stop_daemon(pid_path: &Path, socket_path: &Path) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = pidfile::read_daemon_pid(pid_path)
        .ok_or_else(|| anyhow::anyhow!("Daemon PID file not found - is the daemon running?"))?;
    let raw = i32::try_from(pid).context("Invalid PID in file")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {})", pid))?;

    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(pid_path);
    let _ = std::fs::remove_file(socket_path);

    Ok(())
}

/// Run the daemon until a signal or a stop request arrives.
async fn run_headless(orchestrator: &DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::ClientConnected { connection_id } => {
                    tracing::debug!(connection_id, "Client connected");
                }
                OrchestratorEvent::ClientDisconnected { connection_id } => {
                    tracing::debug!(connection_id, "Client disconnected");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            tracing::info!("Received shutdown signal");
        }
        _ = shutdown.cancelled() => {
            tracing::info!("Received stop request");
        }
    }

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Puts the controlling terminal in raw mode until dropped.
struct RawModeGuard;

impl RawModeGuard {
    /// Enables raw mode when stdin is a terminal.
    fn enable() -> anyhow::Result<Option<Self>> {
        if !std::io::stdin().is_terminal() {
            return Ok(None);
        }
        crossterm::terminal::enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Some(Self))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Streams a session to this terminal until it closes or the user detaches.
///
/// Returns the exit code to leave the CLI with.
async fn attach_session(mut client: IpcClient, session_id: &str) -> anyhow::Result<i32> {
    client
        .attach(session_id)
        .await
        .with_context(|| format!("Failed to attach to session {}", session_id))?;
    if std::io::stdout().is_terminal() {
        if let Ok((cols, rows)) = crossterm::terminal::size() {
            client.resize(session_id, cols, rows).await?;
        }
    }
    let (mut reader, mut writer) = client.into_split();

    eprintln!("[attached to {}; press Ctrl-] to detach]", session_id);
    let raw_mode = RawModeGuard::enable()?;

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buf = [0u8; 1024];

    let code = loop {
        tokio::select! {
            read = stdin.read(&mut buf) => {
                let n = read.context("Failed to read stdin")?;
                let (input, detach) = match buf[..n].iter().position(|b| *b == DETACH_KEY) {
                    Some(pos) => (&buf[..pos], true),
                    None => (&buf[..n], n == 0),
                };
                if !input.is_empty() {
                    let message = TerminalMessage::input(session_id, input.to_vec());
                    writer.send(&IpcRequest::Input(message)).await?;
                }
                if detach {
                    let request = IpcRequest::DetachSession { session_id: session_id.to_string() };
                    writer.send(&request).await?;
                    drop(raw_mode);
                    eprintln!("\r\n[detached from {}]", session_id);
                    break 0;
                }
            }
            response = reader.read_response() => match response? {
                Some(IpcResponse::Terminal(TerminalMessage::Output { data, .. })) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Some(IpcResponse::Terminal(TerminalMessage::Status {
                    status: SessionStatus::Closed,
                    exit_code,
                    ..
                })) => {
                    drop(raw_mode);
                    eprintln!("\r\n[session {} closed, exit code {}]",
                        session_id,
                        exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()));
                    break exit_code.unwrap_or(1);
                }
                Some(IpcResponse::Terminal(TerminalMessage::Status {
                    status: SessionStatus::DataDropped,
                    dropped,
                    ..
                })) => {
                    tracing::warn!(dropped = dropped.unwrap_or(0), "Terminal output dropped");
                }
                Some(IpcResponse::Error { message, .. }) => {
                    tracing::warn!("Daemon error: {}", message);
                }
                Some(_) => {}
                None => {
                    drop(raw_mode);
                    anyhow::bail!("Daemon closed the connection");
                }
            }
        }
    };

    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["ptymux", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start { log_file: false }));

        let cli = Cli::try_parse_from(["ptymux", "start", "--log-file"]).unwrap();
        assert!(matches!(cli.command, Commands::Start { log_file: true }));
    }

    #[test]
    fn test_stop_with_force_and_timeout() {
        let cli = Cli::try_parse_from(["ptymux", "stop", "-f", "--timeout", "10"]).unwrap();
        match cli.command {
            Commands::Stop { force, timeout } => {
                assert!(force);
                assert_eq!(timeout, 10);
            }
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_stop_defaults() {
        let cli = Cli::try_parse_from(["ptymux", "stop"]).unwrap();
        match cli.command {
            Commands::Stop { force, timeout } => {
                assert!(!force);
                assert_eq!(timeout, 30);
            }
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_status_command() {
        let cli = Cli::try_parse_from(["ptymux", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_sessions_list_json() {
        let cli = Cli::try_parse_from(["ptymux", "sessions", "list", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Sessions(SessionsCommands::List { json: true })
        ));
    }

    #[test]
    fn test_sessions_create_with_command() {
        let cli = Cli::try_parse_from([
            "ptymux", "sessions", "create", "--cwd", "/tmp", "-e", "FOO=bar", "--env", "X=1",
            "--", "htop", "-d", "10",
        ])
        .unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Create {
                cwd,
                env,
                cols,
                rows,
                attach,
                command,
            }) => {
                assert_eq!(cwd, Some(PathBuf::from("/tmp")));
                assert_eq!(env, vec!["FOO=bar", "X=1"]);
                assert_eq!((cols, rows), (80, 24));
                assert!(!attach);
                assert_eq!(command, vec!["htop", "-d", "10"]);
            }
            _ => panic!("Expected Create command"),
        }
    }

    #[test]
    fn test_sessions_create_defaults_to_shell() {
        let cli = Cli::try_parse_from(["ptymux", "sessions", "create", "-a"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Create {
                attach, command, ..
            }) => {
                assert!(attach);
                assert!(command.is_empty());
            }
            _ => panic!("Expected Create command"),
        }
    }

    #[test]
    fn test_sessions_kill_default_signal() {
        let cli = Cli::try_parse_from(["ptymux", "sessions", "kill", "abc"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Kill {
                session_id,
                signal,
                force,
            }) => {
                assert_eq!(session_id, "abc");
                assert_eq!(signal, "SIGHUP");
                assert!(!force);
            }
            _ => panic!("Expected Kill command"),
        }
    }

    #[test]
    fn test_sessions_kill_requires_id() {
        assert!(Cli::try_parse_from(["ptymux", "sessions", "kill"]).is_err());
    }

    #[test]
    fn test_attach_command() {
        let cli = Cli::try_parse_from(["ptymux", "attach", "abc"]).unwrap();
        match cli.command {
            Commands::Attach { session_id } => assert_eq!(session_id, "abc"),
            _ => panic!("Expected Attach command"),
        }
    }

    #[test]
    fn test_global_flags_after_command() {
        let cli =
            Cli::try_parse_from(["ptymux", "status", "-v", "--config", "/tmp/c.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["ptymux"]).is_err());
        assert!(Cli::try_parse_from(["ptymux", "sessions"]).is_err());
    }

    #[test]
    fn test_parse_signal_named() {
        assert_eq!(parse_signal("SIGHUP").unwrap(), 1);
        assert_eq!(parse_signal("SIGKILL").unwrap(), 9);
        assert_eq!(parse_signal("term").unwrap(), 15);
    }

    #[test]
    fn test_parse_signal_numeric() {
        assert_eq!(parse_signal("9").unwrap(), 9);
        assert!(parse_signal("0").is_err());
        assert!(parse_signal("64").is_err());
    }

    #[test]
    fn test_parse_signal_invalid() {
        assert!(parse_signal("SIGFOO").is_err());
        assert!(parse_signal("").is_err());
    }

    #[test]
    fn test_parse_env() {
        assert_eq!(
            parse_env("FOO=bar").unwrap(),
            ("FOO".to_string(), "bar".to_string())
        );
        assert_eq!(
            parse_env("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert_eq!(
            parse_env("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_env("NOEQUALS").is_err());
        assert!(parse_env("=value").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(65), "1m 5s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a long command line", 10), "a long ...");
    }

    #[test]
    fn test_format_relative_time() {
        let now = now_millis();
        assert_eq!(format_relative_time(now), "0s ago");
        assert_eq!(format_relative_time(now - 120_000), "2m ago");
        assert_eq!(format_relative_time(now - 2 * 3_600_000), "2h ago");
    }
}
