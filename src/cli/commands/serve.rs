//! Serve command - run the watch service and stream change batches.
//!
//! By default the service runs in a spawned helper process, keeping the OS
//! watcher resources out of the calling process. The supervisor relays the
//! helper's stdout stream; the helper probes its parent and shuts itself
//! down when the parent dies.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::provider::FileWatchProvider;
use crate::watcher::{
    CachingWatcherService, ClientId, FileChange, FileSystemWatcherService, FileWatcherService,
    ParentWatchdog, WatchOptions, WatcherDispatcher,
};
use crate::{debug_event, log_event};

/// Client id the serve command registers for its own provider.
const LOCAL_CLIENT_ID: ClientId = 0;

/// Arguments for the serve command.
pub struct ServeArgs {
    pub paths: Vec<PathBuf>,
    pub ignore: Vec<String>,
    pub foreground: bool,
    pub parent_pid: Option<u32>,
    pub verbose: bool,
    pub config_path: Option<PathBuf>,
}

/// One line of the stdout stream.
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum StreamEvent<'a> {
    Changes { changes: &'a [FileChange] },
    Error { uri: &'a str },
}

/// Run the serve command.
pub async fn run(args: ServeArgs, config: Settings) {
    if args.foreground || !config.server.separate_process {
        run_service(args, config).await;
    } else {
        run_supervisor(args).await;
    }
}

/// Spawn the service as a helper process and relay its stdout stream.
async fn run_supervisor(args: ServeArgs) {
    match relay_helper(&args).await {
        Ok(status) if status.success() => {}
        Ok(status) => {
            // A killed helper (no exit code) is a normal interrupt shutdown.
            if let Some(code) = status.code() {
                eprintln!("Watch helper exited with {status}");
                std::process::exit(code);
            }
        }
        Err(e) => {
            eprintln!("Watch helper failed: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Re-execute the current binary as a foreground helper, relaying its
/// stdout stream until it exits or the supervisor is interrupted.
async fn relay_helper(args: &ServeArgs) -> Result<ExitStatus> {
    let binary = std::env::current_exe().context("cannot locate own binary")?;

    let mut cmd = Command::new(&binary);
    if let Some(cfg) = &args.config_path {
        cmd.arg("--config").arg(cfg);
    }
    cmd.arg("serve")
        .arg("--foreground")
        .arg("--parent-pid")
        .arg(std::process::id().to_string());
    for pattern in &args.ignore {
        cmd.arg("--ignore").arg(pattern);
    }
    if args.verbose {
        cmd.arg("--verbose");
    }
    for path in &args.paths {
        cmd.arg(path);
    }

    let mut child = cmd
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn watch helper")?;

    if let Some(pid) = child.id() {
        debug_event!("serve", "helper spawned", "pid {pid}");
    }

    let stdout = child
        .stdout
        .take()
        .context("watch helper has no stdout")?;
    let mut lines = BufReader::new(stdout).lines();

    // The helper's stdout is the event stream; relay it line by line.
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => println!("{line}"),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("watch helper stream error: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                debug_event!("serve", "interrupt received", "stopping helper");
                if let Err(e) = child.start_kill() {
                    tracing::warn!("failed to stop watch helper: {e}");
                }
                break;
            }
        }
    }

    child.wait().await.context("failed to reap watch helper")
}

/// Run the watch service in this process, streaming batches on stdout.
async fn run_service(args: ServeArgs, config: Settings) {
    let paths = if args.paths.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        args.paths
    };

    // Merge configured patterns with CLI additions, failing fast on typos
    // instead of surfacing them later through the error stream.
    let mut ignored = config.watch.ignored.clone();
    ignored.extend(args.ignore);
    for pattern in &ignored {
        if let Err(e) = glob::Pattern::new(pattern) {
            eprintln!("Invalid ignore pattern '{pattern}': {e}");
            std::process::exit(1);
        }
    }

    let mut options = config.watch.service_options();
    options.verbose = options.verbose || args.verbose;

    let service = Arc::new(FileWatcherService::with_native_backend(options));
    let cache = Arc::new(CachingWatcherService::new(
        LOCAL_CLIENT_ID,
        service.clone() as Arc<dyn FileSystemWatcherService>,
        config.watch.reuse_linger(),
    ));
    let provider = Arc::new(FileWatchProvider::new(cache));
    let dispatcher = Arc::new(WatcherDispatcher::new());
    dispatcher.register_client(LOCAL_CLIENT_ID, provider.clone());
    service.set_client(Some(dispatcher));

    // Subscribe before the first watch starts so no batch is dropped.
    let mut changes = provider.subscribe_changes();
    let mut errors = provider.subscribe_errors();

    let watch_options = WatchOptions { ignored };
    let mut handles = Vec::new();
    for path in &paths {
        let absolute = match std::path::absolute(path) {
            Ok(absolute) => absolute,
            Err(e) => {
                eprintln!("Cannot resolve {}: {e}", path.display());
                continue;
            }
        };
        match provider.watch(&absolute, watch_options.clone()) {
            Ok(handle) => {
                log_event!("serve", "watching", "{}", absolute.display());
                handles.push(handle);
            }
            Err(e) => eprintln!("Cannot watch {}: {e}", absolute.display()),
        }
    }
    if handles.is_empty() {
        eprintln!("Nothing to watch");
        std::process::exit(1);
    }

    eprintln!(
        "Watching {} path(s) (debounce: {}ms)",
        handles.len(),
        config.watch.debounce_ms
    );
    eprintln!("Streaming change batches on stdout, one JSON object per line");

    let shutdown = CancellationToken::new();
    if let Some(pid) = args.parent_pid {
        let watchdog = ParentWatchdog::new(pid, config.server.parent_check_interval());
        tokio::spawn(watchdog.run(shutdown.clone()));
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::signal::ctrl_c() => {
                log_event!("serve", "interrupt received");
                break;
            }
            batch = changes.recv() => match batch {
                Ok(batch) => emit(&StreamEvent::Changes { changes: &batch }),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("change stream lagged, {missed} batches dropped");
                }
                Err(RecvError::Closed) => break,
            },
            err = errors.recv() => match err {
                Ok(uri) => emit(&StreamEvent::Error { uri: &uri }),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("error stream lagged, {missed} events dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    drop(handles);
    service.dispose_all();
    log_event!("serve", "service stopped");
}

fn emit(event: &StreamEvent<'_>) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!("cannot serialize stream event: {e}"),
    }
}
