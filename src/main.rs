use log::{error, info};
use std::sync::Arc;
use std::time::Instant;

use actix_web::{App, HttpServer, web};

use swgate::{
    AppConfig, AppState, GpioBackend, GpioController, HttpRemoteApi, ProbeSettings, RemoteApi,
    UserDirectory, users,
};

#[cfg(feature = "chardev-gpio")]
use swgate::LibgpiodBackend;
#[cfg(not(feature = "chardev-gpio"))]
use swgate::SysfsBackend;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let started_at = Instant::now();
    env_logger::init();

    let config = match AppConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{e}");
            return Err(std::io::Error::other(e.to_string()));
        }
    };
    info!(
        "Starting GPIO controller for device {} ({})",
        config.api.device_id, config.environment
    );

    let backend: Arc<dyn GpioBackend> = {
        #[cfg(feature = "chardev-gpio")]
        {
            Arc::new(LibgpiodBackend::default())
        }
        #[cfg(not(feature = "chardev-gpio"))]
        {
            Arc::new(SysfsBackend::default())
        }
    };

    let store = users::open_store(&config.database_url)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let api: Arc<dyn RemoteApi> = Arc::new(HttpRemoteApi::new(config.api.clone()));
    let directory = Arc::new(UserDirectory::new(
        store,
        api.clone(),
        config.pins.switch_pins.clone(),
        config.is_production(),
    ));

    let probe = ProbeSettings {
        probe_pin: config.probe_pin,
        ..ProbeSettings::default()
    };
    let controller = Arc::new(
        GpioController::initialize(config.clone(), probe, backend, directory.clone(), api).await,
    );

    directory.sync().await;
    controller.start_monitoring().await;

    let app_state = AppState::new(controller.clone(), config.clone(), started_at);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(""))
    })
    .bind((config.http.host.as_str(), config.http.port))?;

    info!(
        "Server running on {}:{} in {:?} mode",
        config.http.host,
        config.http.port,
        controller.mode()
    );

    // run() resolves after SIGINT/SIGTERM once workers have stopped
    let result = server.run().await;
    controller.shutdown().await;
    result
}
