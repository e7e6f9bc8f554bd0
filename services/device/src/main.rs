// device: Samples the configured drivers, buffers the readings locally,
// and delivers them to the server over an authenticated websocket.

use device::config::{read_connection_settings, read_device_config, read_driver_configs};
use device::registry::DriverRegistry;
use device::runtime::DeviceRuntime;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    // tokio-tungstenite needs a process-wide TLS provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(version = env!("CARGO_PKG_VERSION"), "starting meridian device");

    let config = match read_device_config() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid device config");
            std::process::exit(1);
        }
    };
    let settings = match read_connection_settings() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "invalid connection settings");
            std::process::exit(1);
        }
    };
    let driver_configs = match read_driver_configs() {
        Ok(configs) => configs,
        Err(err) => {
            error!(error = %err, "invalid driver config");
            std::process::exit(1);
        }
    };

    let registry = DriverRegistry::with_builtins();
    let runtime = DeviceRuntime::new(config, settings, registry, driver_configs);

    match runtime.run().await {
        Ok(()) => info!("device stopped"),
        Err(err) => {
            error!(error = %err, "device failed to start");
            std::process::exit(1);
        }
    }
}
