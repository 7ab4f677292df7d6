use anyhow::{Context, bail};
use calloop::EventLoop;
use clap::Parser;
use kestrel::{
    ManagerError, Result,
    capabilities,
    channels::{self, SOCKET_ENV},
    cli::{self, Cli},
    config,
    diagnostics::{self, DEFAULT_SHMLOG_SIZE, DiagnosticLog, SHMLOG_PATH_ENV},
    ipc,
    lifecycle::{Lifecycle, Phase},
    reactor, reconcile,
    restart::{self, RestartState},
    signals,
    state::Manager,
    tree::WindowTree,
    x11::{SOCKET_PATH_ATOM, X11Connection},
};
use std::{backtrace::Backtrace, ffi::OsString, path::PathBuf, sync::Mutex};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    init_backtrace_defaults();
    let cli = Cli::parse();

    if let Some(outcome) = run_client_mode(&cli) {
        if let Err(err) = outcome {
            eprintln!("kestrel: {err:#}");
            std::process::exit(1);
        }
        return;
    }

    match run(&cli) {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            tracing::error!("fatal: {err}");
            eprintln!("kestrel: {err}");
            diagnostics::remove_artifact();
            std::process::exit(1);
        }
    }
}

/// Everything that talks to a running instance instead of becoming one.
fn run_client_mode(cli: &Cli) -> Option<anyhow::Result<()>> {
    if cli.version {
        println!("{}", cli::version_line());
        return Some(Ok(()));
    }
    if cli.more_version {
        return Some(print_more_version());
    }
    if cli.get_socketpath {
        return Some(socket_path_for_client().map(|path| println!("{}", path.display())));
    }
    if !cli.command.is_empty() {
        return Some(send_ipc_command(&cli.command.join(" ")));
    }
    None
}

fn print_more_version() -> anyhow::Result<()> {
    println!("Binary {}", cli::version_line());
    let path = socket_path_for_client()?;
    let running = ipc::send_command(&path, "version")?;
    println!("Running {running}");
    Ok(())
}

fn send_ipc_command(command: &str) -> anyhow::Result<()> {
    let path = socket_path_for_client()?;
    let reply = ipc::send_command(&path, command)?;
    println!("{reply}");
    if reply.starts_with("error:") {
        bail!("command failed");
    }
    Ok(())
}

/// `KESTRELSOCK`, else whatever the running instance published on the root
/// window.
fn socket_path_for_client() -> anyhow::Result<PathBuf> {
    if let Some(path) = std::env::var_os(SOCKET_ENV).filter(|path| !path.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let conn = X11Connection::connect(None).context("cannot look up the ipc socket")?;
    let path = conn
        .root_string_property(SOCKET_PATH_ATOM)
        .context("failed to read the ipc socket path from the root window")?
        .context("no running kestrel found (root window has no socket path)")?;
    Ok(PathBuf::from(path))
}

fn run(cli: &Cli) -> Result<i32> {
    init_logging(cli)?;
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();
        tracing::error!("panic: {panic_info}\n{backtrace}");
        eprintln!("panic: {panic_info}\n{backtrace}");
    }));
    signals::install_core_handlers()?;
    if cli.disable_signalhandler {
        tracing::info!("--disable-signalhandler is ignored, crash handlers stay installed");
    }

    let start_args: Vec<OsString> = std::env::args_os().collect();
    let restart_state = RestartState::take_from_env(cli);
    let activation = channels::take_activation_fds();
    let loaded = config::load_or_default(cli.config.as_deref());
    tracing::info!(
        config = ?loaded.path,
        restart = restart_state.is_restart(),
        activation_fds = activation.len(),
        "starting {}",
        cli::version_line()
    );

    let mut lifecycle = Lifecycle::default();
    let mut event_loop: EventLoop<Manager> =
        EventLoop::try_new().map_err(|e| ManagerError::EventLoop(e.to_string()))?;

    let conn = X11Connection::connect(None)?;
    conn.claim_root()?;

    lifecycle.advance(Phase::Negotiating);
    let caps = capabilities::negotiate(conn.conn(), conn.screen())?;

    let mut state = Manager::new(
        conn,
        caps,
        Box::new(WindowTree::new()),
        loaded.config,
        lifecycle,
        event_loop.handle(),
        event_loop.get_signal(),
        start_args,
    );
    state.watch_protocol()?;
    signals::install_terminate_handlers(&event_loop.handle())?;

    state.channels.adopt_activation(activation);
    if let Some(manifest) = &restart_state.manifest {
        state.channels.adopt_manifest(manifest);
    }
    state.setup_ipc();

    state.lifecycle.advance(Phase::RestoringOrBuildingTree);
    restart::consume_snapshot(
        &mut *state.tree,
        restart_state.snapshot.as_deref(),
        restart_state.delete_after_use,
    );

    state.lifecycle.advance(Phase::ReconcilingExistingWindows);
    reconcile::reconcile(&mut state)?;
    let pruned = state.tree.prune_placeholders();
    if pruned > 0 {
        tracing::info!(pruned, "restored windows no longer exist");
    }

    if let Some(fd) = restart_state.continuation_fd {
        state.confirm_restart(fd);
    }

    state.run_autostart(cli.no_autostart);
    state.lifecycle.advance(Phase::Running);
    tracing::info!(
        socket = ?state.ipc_socket_path(),
        capabilities = ?state.caps.flags,
        windows = state.tree.managed_windows().len(),
        "running"
    );

    reactor::run(&mut event_loop, None, &mut state, Manager::reap_children)?;

    Ok(state.shutdown())
}

fn init_backtrace_defaults() {
    if std::env::var_os("RUST_BACKTRACE").is_none() {
        // Safety: called at startup before creating any threads.
        unsafe { std::env::set_var("RUST_BACKTRACE", "1") };
    }
    if std::env::var_os("RUST_LIB_BACKTRACE").is_none() {
        // Safety: called at startup before creating any threads.
        unsafe { std::env::set_var("RUST_LIB_BACKTRACE", "0") };
    }
}

const DEFAULT_LOG_FILTER: &str = "kestrel=info";

fn init_logging(cli: &Cli) -> Result<()> {
    let env_filter = if cli.debug {
        EnvFilter::new("kestrel=trace")
    } else if cli.verbose {
        EnvFilter::new("kestrel=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    let limit = cli.shmlog_size.unwrap_or(DEFAULT_SHMLOG_SIZE);
    let shmlog_path = diagnostics::shmlog_path(std::process::id());
    let (shmlog, shmlog_error) = if limit == 0 {
        (None, None)
    } else {
        match DiagnosticLog::create(&shmlog_path, limit) {
            Ok(log) => (Some(log), None),
            Err(err) => (None, Some(err)),
        }
    };

    let shmlog_layer = shmlog.map(|log| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(log))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(true)
                .with_writer(std::io::stderr),
        )
        .with(shmlog_layer)
        .init();

    match (diagnostics::artifact_path(), shmlog_error) {
        (Some(path), _) => {
            // Safety: called at startup before creating any threads.
            unsafe { std::env::set_var(SHMLOG_PATH_ENV, &path) };
            tracing::info!(path = %path.display(), limit, "logging initialized");
        }
        (None, Some(err)) => {
            tracing::warn!(path = %shmlog_path.display(), "diagnostic log disabled: {err}");
        }
        (None, None) => tracing::info!("logging initialized, diagnostic log disabled"),
    }

    Ok(())
}
