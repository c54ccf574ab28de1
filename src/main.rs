use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use deskbridge::{
    auth::SessionAuthenticator,
    config::{self, BridgeConfig},
    lock,
    mailbox::{self, model::ActionEntry, status::StatusWriter, MailboxBridge},
    mcp::RpcServer,
    tools::{builtin, ToolRegistry},
    AppContext,
};

#[derive(Parser)]
#[command(
    name = "deskbridge",
    about = "File-mailbox and tool-transport bridge daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory for the mailbox, lock, session store, and status file
    #[arg(long, env = "DESKBRIDGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DESKBRIDGE_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "DESKBRIDGE_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log format: "pretty" or "json"
    #[arg(long, env = "DESKBRIDGE_LOG_FORMAT")]
    log_format: Option<String>,

    /// Singleton role name for the instance lock
    #[arg(long, env = "DESKBRIDGE_ROLE")]
    role: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the bridge daemon (default when no subcommand given).
    ///
    /// Serves the tool protocol on stdin/stdout and the mailbox bridge on
    /// the data directory. All diagnostics go to stderr — stdout carries
    /// only protocol messages.
    Serve,
    /// Print the bridge's aggregate status.
    Status,
    /// Submit a mailbox action and wait for its terminal state.
    ///
    /// Writes a pending entry file into the watched directory, then polls
    /// the same file until the bridge rewrites it as completed or failed.
    Send {
        /// Action (tool) name to invoke
        action: String,
        /// JSON object of action parameters
        #[arg(long)]
        params: Option<String>,
        /// Session id for authenticated requests
        #[arg(long, requires = "token")]
        session: Option<String>,
        /// Bearer token matching --session
        #[arg(long, requires = "session")]
        token: Option<String>,
        /// Producer identifier recorded on the entry
        #[arg(long)]
        source: Option<String>,
        /// Seconds to wait for a terminal state
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Manage session tokens.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Mint a fresh token for a session id and print it.
    New { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = BridgeConfig::load(args.data_dir.clone())?;
    if let Some(level) = args.log {
        config.log_level = level;
    }
    if let Some(path) = args.log_file {
        config.log_file = Some(path);
    }
    if let Some(format) = args.log_format {
        config.log_format = format;
    }
    if let Some(role) = args.role {
        config.role = role;
    }

    let _log_guard = setup_logging(&config.log_level, config.log_file.as_deref(), &config.log_format);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Status => status(&config),
        Command::Send {
            action,
            params,
            session,
            token,
            source,
            timeout_secs,
        } => send(&config, action, params, session, token, source, timeout_secs).await,
        Command::Session {
            action: SessionAction::New { id },
        } => session_new(&config, &id),
    }
}

// ─── serve ────────────────────────────────────────────────────────────────────

async fn serve(config: BridgeConfig) -> Result<()> {
    // At most one live bridge per role per machine. Losing this race is an
    // expected outcome, not a fault: exit quietly.
    let guard = match lock::acquire(&config.data_dir, &config.role)? {
        lock::Acquired::Held(guard) => guard,
        lock::Acquired::AlreadyRunning { pid } => {
            info!(
                role = %config.role,
                pid,
                "another instance already serves this role — exiting"
            );
            return Ok(());
        }
    };

    config::ensure_layout(&config)?;
    let ctx = build_context(config)?;

    let bridge = MailboxBridge::new(Arc::clone(&ctx));
    bridge.spawn()?;

    // Initial status record so producers can see us immediately.
    let initial = bridge.snapshot(true);
    if let Err(e) = ctx.status.write_if_changed(&initial) {
        warn!(err = %e, "failed to write initial status");
    }

    let server = RpcServer::new(Arc::clone(&ctx));
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    tokio::select! {
        res = server.serve(stdin, stdout) => {
            if let Err(e) = res {
                warn!(err = %e, "transport loop ended with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received — shutting down");
        }
        _ = terminate_signal() => {
            info!("termination signal received — shutting down");
        }
    }

    // Terminal status write is unconditional; the lock releases on guard
    // drop below, and the guard's Drop also covers panic unwinds.
    let mut stopped = bridge.snapshot(true);
    stopped.status = "stopped".into();
    if let Err(e) = ctx.status.write(&stopped) {
        warn!(err = %e, "failed to write stopped status");
    }
    guard.release();
    Ok(())
}

fn build_context(config: BridgeConfig) -> Result<Arc<AppContext>> {
    let config = Arc::new(config);

    let mut registry = ToolRegistry::new();
    builtin::register_builtins(&mut registry, config.status_file())
        .context("register built-in tools")?;

    let auth = Arc::new(SessionAuthenticator::new(
        config.session_store(),
        config.auth.token_ttl_secs,
    ));
    let status = Arc::new(StatusWriter::new(config.status_file()));

    Ok(Arc::new(AppContext {
        config,
        registry: Arc::new(registry),
        auth,
        status,
        started_at: std::time::Instant::now(),
    }))
}

// ─── status ───────────────────────────────────────────────────────────────────

fn status(config: &BridgeConfig) -> Result<()> {
    let path = config.status_file();
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(_) => {
            println!("bridge not running (no status file at {})", path.display());
            return Ok(());
        }
    };
    let status: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parse status file {}", path.display()))?;

    let pid = status.get("pid").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    let alive = pid != 0 && lock::pid_alive(pid);
    println!(
        "bridge is {} (pid {pid})",
        if alive { "running" } else { "not running" }
    );
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

// ─── send ─────────────────────────────────────────────────────────────────────

async fn send(
    config: &BridgeConfig,
    action: String,
    params: Option<String>,
    session: Option<String>,
    token: Option<String>,
    source: Option<String>,
    timeout_secs: u64,
) -> Result<()> {
    let params: Value = match params {
        Some(raw) => serde_json::from_str(&raw).context("--params must be a JSON object")?,
        None => serde_json::json!({}),
    };

    let mut entry = ActionEntry::new(action, params);
    entry.source = source;
    if let (Some(session_id), Some(token)) = (session, token) {
        entry.session = Some(mailbox::SessionClaim { session_id, token });
    }

    std::fs::create_dir_all(config.mailbox_dir())?;
    let path = config.mailbox_dir().join(format!("{}.json", entry.id));
    mailbox::bridge::write_entry(&path, &entry)?;
    println!("submitted action '{}' (id {})", entry.action, entry.id);

    // Poll the same file until the bridge rewrites it as terminal.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(timeout_secs);
    loop {
        if std::time::Instant::now() >= deadline {
            bail!("bridge did not process the action within {timeout_secs}s");
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        let Ok(raw) = std::fs::read_to_string(&path) else {
            // Deleted before we saw the terminal write — grace period was
            // shorter than our poll. Report it as processed-but-unobserved.
            bail!("entry file disappeared before a terminal state was observed");
        };
        let Ok(current) = serde_json::from_str::<ActionEntry>(&raw) else {
            continue;
        };
        if !current.status.is_terminal() {
            continue;
        }

        match current.status {
            mailbox::ActionStatus::Completed => {
                println!(
                    "completed: {}",
                    serde_json::to_string_pretty(&current.result.unwrap_or(Value::Null))?
                );
                return Ok(());
            }
            _ => {
                println!(
                    "failed: {}",
                    current.error.as_deref().unwrap_or("unknown error")
                );
                std::process::exit(1);
            }
        }
    }
}

// ─── session ──────────────────────────────────────────────────────────────────

fn session_new(config: &BridgeConfig, id: &str) -> Result<()> {
    let auth = SessionAuthenticator::new(config.session_store(), config.auth.token_ttl_secs);
    let record = auth.create(id)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "sessionId": id,
            "token": record.token,
            "expiresAt": record.expires_at,
        }))?
    );
    Ok(())
}

// ─── Signals ──────────────────────────────────────────────────────────────────

/// Resolves when SIGTERM arrives, so the shutdown path below (final status
/// write, lock release, log flush) runs for service managers that terminate
/// rather than interrupt.
#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            warn!(err = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

/// No SIGTERM off unix; Ctrl-C remains the only signal path.
#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

// ─── Logging ──────────────────────────────────────────────────────────────────

/// Initialize tracing. Returns a `WorkerGuard` that must stay alive for the
/// process lifetime when file logging is enabled.
///
/// Console output always goes to stderr: in serve mode stdout is the
/// protocol stream, and a single stray diagnostic byte there would
/// desynchronize the peer's parser.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("deskbridge.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stderr only",
                dir.display()
            );
            init_stderr_only(log_level, use_json);
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }
        Some(guard)
    } else {
        init_stderr_only(log_level, use_json);
        None
    }
}

fn init_stderr_only(log_level: &str, use_json: bool) {
    if use_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(log_level)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}
