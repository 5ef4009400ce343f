//! Bindu - data acquisition node daemon

use bindu::adc::create_adc;
use bindu::config::Config;
use bindu::error::{Error, Result};
use bindu::net::socket::SocketPool;
use bindu::net::stack::{LinkState, NetStack, OsStack};
use bindu::state::NodeState;
use bindu::tasks::{Acquisition, NetHandle, NetworkTask};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    // Compile in everything down to debug; the runtime filter below is what
    // CONFIG_LOG_LEVEL commands move around.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    log::set_max_level(log::LevelFilter::Info);

    log::info!("Bindu v{} starting...", env!("CARGO_PKG_VERSION"));

    // Get config path from args or default
    let config_path = env::args().nth(1).unwrap_or_else(|| "bindu.toml".to_string());

    log::info!("Using config: {}", config_path);
    let config = Config::load_or_default(&config_path)?;

    log::info!(
        "ADC driver: {} (channel {}), threshold {} mV, batch {}",
        config.adc.driver,
        config.adc.channel,
        config.acquisition.threshold_mv,
        config.acquisition.batch_size
    );

    // Network stack and socket pool
    let link = LinkState::new();
    let stack = OsStack::new(Arc::clone(&link), config.network.interface.as_deref());
    let pool = SocketPool::new(Arc::clone(&stack) as Arc<dyn NetStack>, link);

    // Shared runtime state
    let node = Arc::new(NodeState::new(&config));

    // ADC bring-up is fatal on failure
    let adc = create_adc(&config.adc)?;
    let acquisition = Acquisition::new(Arc::clone(&node), adc)?;

    let handle = NetHandle::new(Arc::clone(&node), Arc::clone(&pool));

    // Shutdown signal handler
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);

    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Config(format!("Error setting Ctrl-C handler: {}", e)))?;

    // Spawn the two task threads
    let network = NetworkTask::new(
        Arc::clone(&node),
        Arc::clone(&pool),
        acquisition.clone(),
        handle.clone(),
        config.network.port,
        Arc::clone(&running),
    );
    let net_thread = network.spawn()?;
    let acq_thread = acquisition.spawn(handle, Arc::clone(&running))?;

    log::info!(
        "Bindu running on UDP port {}. Press Ctrl-C to stop.",
        config.network.port
    );

    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("Shutting down...");
    let _ = net_thread.join();
    let _ = acq_thread.join();

    log::info!("Bindu stopped");
    Ok(())
}
