use std::sync::Arc;

use anyhow::Context;
use sandterm::{
    host_sandbox_config, init_file_logging, load_config, parse_cli_flags, print_cli_help,
    session_settings, spawn_event_logger, spawn_key_reader, CrosstermDisplay, RawModeGuard,
    TerminalPreview,
};
use sandterm_eventbus::{SessionEventBus, SessionEventBusConfig};
use sandterm_host::HostSandbox;
use sandterm_lifecycle::SandboxLifecycle;
use sandterm_session::Session;
use tokio::sync::mpsc;

const KEY_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = parse_cli_flags(std::env::args().skip(1))?;
    if flags.show_help {
        print_cli_help();
        return Ok(());
    }

    let config = load_config(&flags)?;
    let log_path = flags.log_path.clone().unwrap_or_else(|| config.log_path());
    init_file_logging(&log_path)?;
    tracing::info!(log_path = %log_path.display(), "sandterm starting");

    let eventbus = Arc::new(SessionEventBus::new(SessionEventBusConfig::default()));
    let event_logger = spawn_event_logger(eventbus.subscribe());

    let lifecycle = SandboxLifecycle::new(
        Arc::new(HostSandbox::new(host_sandbox_config(&config))),
        Arc::clone(&eventbus),
    )
    .with_surface(Arc::new(TerminalPreview::new()));

    let guard = RawModeGuard::enable().context("failed to enable raw terminal mode")?;
    let mut session = Session::open(
        lifecycle.clone(),
        Box::new(CrosstermDisplay::new()),
        session_settings(&config),
    );

    let (key_tx, mut key_rx) = mpsc::channel(KEY_CHANNEL_CAPACITY);
    let reader = spawn_key_reader(key_tx).context("failed to start key reader")?;
    session.run(&mut key_rx).await;
    drop(key_rx);
    reader.stop();
    drop(guard);

    let snapshot = lifecycle.perf_snapshot().await;
    tracing::info!(?snapshot, "sandterm stopped");
    event_logger.abort();
    Ok(())
}
