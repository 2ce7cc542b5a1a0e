//! upowerd - power device observation daemon
//!
//! A privileged service that watches the machine's power sources
//! (batteries, mains, UPSes, peripheral batteries), normalizes them into a
//! stable device model and publishes it over a Unix socket bus surface.
//!
//! # Exit codes
//! - 0: normal shutdown
//! - 1: initialization error
//! - 2: bus socket could not be acquired

mod backend;
mod daemon;
mod server;

use std::path::Path;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use up_core::{constants::env as env_vars, DaemonConfig, SourceAdapter, SysfsAdapter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const EXIT_INIT_ERROR: i32 = 1;
const EXIT_BUS_ACQUIRE: i32 = 2;

// ============================================================================
// Platform Paths
// ============================================================================

fn default_socket_path() -> &'static str {
    if Path::new("/run").exists() {
        "/run/upowerd.sock"
    } else {
        "/var/run/upowerd.sock"
    }
}

fn pid_file_path() -> &'static str {
    if Path::new("/run").exists() {
        "/run/upowerd.pid"
    } else {
        "/var/run/upowerd.pid"
    }
}

// ============================================================================
// Process Hygiene
// ============================================================================

/// Remove loader-affecting variables and pin a predictable locale.
fn sanitize_environment() {
    const DANGEROUS_VARS: &[&str] = &[
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "LD_AUDIT",
        "LD_DEBUG",
        "IFS",
    ];
    for var in DANGEROUS_VARS {
        std::env::remove_var(var);
    }
    std::env::set_var("LC_ALL", "C");
    debug!("environment sanitized");
}

fn set_secure_umask() {
    // SAFETY: umask only sets the process file creation mask.
    unsafe { libc::umask(0o022) };
}

// ============================================================================
// PID File Management
// ============================================================================

fn read_running_pid() -> Option<i32> {
    let content = std::fs::read_to_string(pid_file_path()).ok()?;
    let pid: i32 = content.trim().parse().ok()?;
    // SAFETY: kill with signal 0 only probes for process existence.
    if unsafe { libc::kill(pid, 0) } == 0 {
        Some(pid)
    } else {
        None
    }
}

/// Ask a running instance to go away and wait for it. Used by --replace.
fn replace_running_instance() -> bool {
    let Some(pid) = read_running_pid() else {
        return true;
    };
    info!("replacing running instance (PID {})", pid);
    // SAFETY: SIGTERM to a PID we just probed; worst case it is gone already.
    unsafe { libc::kill(pid, libc::SIGTERM) };

    for _ in 0..20 {
        std::thread::sleep(Duration::from_millis(100));
        // SAFETY: existence probe as above.
        if unsafe { libc::kill(pid, 0) } != 0 {
            return true;
        }
    }
    error!("running instance (PID {}) did not exit", pid);
    false
}

fn write_pid_file() -> std::io::Result<()> {
    use std::io::Write;

    let path = pid_file_path();
    if let Some(old_pid) = read_running_pid() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("another instance is running (PID {})", old_pid),
        ));
    }
    let _ = std::fs::remove_file(path);

    let mut file = std::fs::File::create(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;
    debug!("PID file written: {}", path);
    Ok(())
}

fn cleanup(socket_path: &str) {
    if Path::new(socket_path).exists() {
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!("failed to remove socket: {}", e);
        }
    }
    let pid_file = pid_file_path();
    if Path::new(pid_file).exists() {
        if let Err(e) = std::fs::remove_file(pid_file) {
            warn!("failed to remove PID file: {}", e);
        }
    }
}

// ============================================================================
// CLI
// ============================================================================

struct CliOptions {
    socket_path: String,
    verbose: u8,
    timed_exit: Option<u64>,
    immediate_exit: bool,
    replace: bool,
}

fn print_help() {
    eprintln!("upowerd {} - power device observation daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    upowerd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    --verbose           Increase log verbosity (repeatable)");
    eprintln!("    --timed-exit N      Exit after N seconds of inactivity");
    eprintln!("    --immediate-exit    Exit right after coldplug");
    eprintln!("    --replace           Take over from a running instance");
    eprintln!("    -s, --socket PATH   Bus socket path (default per OS)");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    UPOWER_LOG              Log filter (tracing syntax)");
    eprintln!("    UPOWER_CONF_FILE_NAME   Config file path");
    eprintln!("    UPOWER_HISTORY_DIR      History persistence directory");
}

fn parse_args() -> CliOptions {
    let args: Vec<String> = std::env::args().collect();
    let mut options = CliOptions {
        socket_path: default_socket_path().to_string(),
        verbose: 0,
        timed_exit: None,
        immediate_exit: false,
        replace: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                println!("upowerd {}", VERSION);
                std::process::exit(0);
            }
            "--verbose" => {
                options.verbose += 1;
            }
            "--timed-exit" => {
                i += 1;
                let Some(value) = args.get(i).and_then(|v| v.parse().ok()) else {
                    eprintln!("Error: --timed-exit requires a number of seconds");
                    std::process::exit(EXIT_INIT_ERROR);
                };
                options.timed_exit = Some(value);
            }
            "--immediate-exit" => {
                options.immediate_exit = true;
            }
            "--replace" => {
                options.replace = true;
            }
            "-s" | "--socket" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    eprintln!("Error: --socket requires a path argument");
                    std::process::exit(EXIT_INIT_ERROR);
                };
                options.socket_path = value.clone();
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(EXIT_INIT_ERROR);
            }
        }
        i += 1;
    }

    options
}

// ============================================================================
// Logging
// ============================================================================

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => std::env::var(env_vars::LOG).unwrap_or_else(|_| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    let use_journald = Path::new("/run/systemd/journal/socket").exists();
    if use_journald {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&filter))
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("journald unavailable ({}), logging to stderr", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(&filter)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// Adapters
// ============================================================================

fn build_adapters() -> Vec<Box<dyn SourceAdapter>> {
    let mut adapters: Vec<Box<dyn SourceAdapter>> = Vec::new();

    adapters.push(Box::new(SysfsAdapter::new()));

    #[cfg(target_os = "linux")]
    {
        // Skip the HID scan when running against a mock tree
        if std::env::var(env_vars::SYSFS_PATH).is_err() {
            adapters.push(Box::new(up_core::HidUpsAdapter::new()));
        }
    }

    #[cfg(target_os = "openbsd")]
    {
        match up_core::ApmAdapter::new() {
            Ok(apm) => adapters.push(Box::new(apm)),
            Err(e) => warn!("APM adapter disabled: {}", e),
        }
    }

    adapters
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // PHASE 1: hygiene before anything else runs
    sanitize_environment();
    set_secure_umask();

    // PHASE 2: arguments and logging
    let options = parse_args();
    init_logging(options.verbose);

    info!("upowerd {} starting", VERSION);
    info!("socket path: {}", options.socket_path);

    // PHASE 3: single-instance handling
    if options.replace && !replace_running_instance() {
        std::process::exit(EXIT_INIT_ERROR);
    }
    if let Err(e) = write_pid_file() {
        error!("could not write PID file: {}", e);
        std::process::exit(EXIT_INIT_ERROR);
    }

    // PHASE 4: configuration and daemon state
    let config = DaemonConfig::load();
    debug!("config: {:?}", config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    if let Err(e) = ctrlc::set_handler({
        let shutdown_tx = shutdown_tx.clone();
        move || {
            let _ = shutdown_tx.send(true);
        }
    }) {
        warn!("failed to install signal handler: {}", e);
    }

    let run_options = daemon::RunOptions {
        timed_exit: options.timed_exit,
        immediate_exit: options.immediate_exit,
    };
    let (daemon, handles) = match daemon::Daemon::new(
        config,
        run_options,
        VERSION,
        build_adapters(),
        shutdown_rx.clone(),
    ) {
        Ok(parts) => parts,
        Err(e) => {
            error!("daemon init failed: {}", e);
            cleanup(&options.socket_path);
            std::process::exit(EXIT_INIT_ERROR);
        }
    };

    // PHASE 5: acquire the bus socket before declaring ready
    let listener = match server::bind_listener(&options.socket_path).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("giving up on bus socket: {}", e);
            cleanup(&options.socket_path);
            std::process::exit(EXIT_BUS_ACQUIRE);
        }
    };

    let server_task = tokio::spawn(server::run_server(
        listener,
        handles.calls,
        handles.signals,
        shutdown_rx,
        VERSION.to_string(),
    ));

    // PHASE 6: main loop until shutdown
    let result = daemon.run().await;

    // PHASE 7: stop the server and clean up
    let _ = shutdown_tx.send(true);
    let _ = server_task.await;
    cleanup(&options.socket_path);

    if let Err(e) = result {
        error!("daemon error: {}", e);
        std::process::exit(EXIT_INIT_ERROR);
    }
    info!("upowerd terminated");
}
