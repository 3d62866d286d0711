//! pelbox-server: HTTP command daemon for the pelbox locker
//!
//! Every command is checked against the member's identity provider session
//! before any actuator moves:
//! - Lock and dismantle relays
//! - Expansion ram with its confirmation latch
//! - Door motor

mod error;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pelbox_core::config::{HardwareBackend, HardwareConfig, StoreBackend, StoreConfig};
use pelbox_core::{
    CommandGateway, Config, DeviceStore, Hardware, KeycloakClient, MemoryStore, PgStore,
    SequenceController, SessionAuthority,
};

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "pelbox_server=debug,pelbox_core=debug,tower_http=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut config = Config::load().context("failed to load config")?;
    config.apply_env();
    config.validate()?;

    // Service login; the daemon cannot authorize anything without it
    let provider = KeycloakClient::new(&config.identity)?;
    tracing::info!("Identity provider: {}", config.identity.base_url);
    let authority = SessionAuthority::connect(Arc::new(provider))
        .await
        .context("initial service login to the identity provider failed")?;

    let store = connect_store(&config.store).await?;
    let hardware = build_hardware(&config.hardware)?;
    let controller = SequenceController::new(hardware, &config.calibration)?;

    let gateway = CommandGateway::new(
        Arc::new(authority),
        store,
        controller,
        config.device.app_secret.clone(),
    );
    if config.device.app_secret.is_empty() {
        tracing::warn!("No application secret configured, the box will never report as connected");
    }
    let state = Arc::new(AppState::new(gateway));

    // Build router
    let app = handlers::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from((
        config.server.listen_addr.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));
    tracing::info!("pelbox-server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn connect_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn DeviceStore>> {
    match config.backend {
        StoreBackend::Postgres => {
            let store = PgStore::connect(config)
                .await
                .context("failed to connect to the member database")?;
            tracing::info!("Connected to member database");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            let path = config
                .seed_file
                .as_deref()
                .context("store.seed_file is required with the memory backend")?;
            let store = MemoryStore::from_seed_file(path)?;
            tracing::warn!("Using in-memory store, device rows will not survive a restart");
            Ok(Arc::new(store))
        }
    }
}

fn build_hardware(config: &HardwareConfig) -> anyhow::Result<Hardware> {
    match config.backend {
        HardwareBackend::Simulated => {
            tracing::info!(realtime = config.simulate_realtime, "Using simulated actuators");
            Ok(Hardware::simulated_logging(config.simulate_realtime))
        }
        #[cfg(feature = "gpio")]
        HardwareBackend::Gpio => {
            let hardware = pelbox_core::actuator::gpio::hardware(config)
                .context("failed to claim GPIO pins")?;
            tracing::info!("Actuators on GPIO at {} Hz PWM", config.pwm_frequency);
            Ok(hardware)
        }
        #[cfg(not(feature = "gpio"))]
        HardwareBackend::Gpio => {
            anyhow::bail!("hardware.backend = \"gpio\" requires building with the gpio feature")
        }
    }
}
