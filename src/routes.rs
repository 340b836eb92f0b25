use log::info;
use std::sync::Arc;
use std::time::Instant;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use serde::Serialize;
use serde_json::json;

use crate::config::AppConfig;
use crate::controller::GpioController;
use crate::error::AppError;

const PROC_SELF_STATUS: &str = "/proc/self/status";

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<GpioController>,
    pub config: Arc<AppConfig>,
    pub started_at: Instant,
}

impl AppState {
    /// `started_at` is the process start, uptime in `/health` counts from it.
    pub fn new(
        controller: Arc<GpioController>,
        config: Arc<AppConfig>,
        started_at: Instant,
    ) -> Self {
        Self {
            controller,
            config,
            started_at,
        }
    }

    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/")
                    .route(web::get().to(index))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/health")
                    .route(web::get().to(health))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/status")
                    .route(web::get().to(status))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/test/switch/{index}")
                    .route(web::get().to(test_switch))
                    .route(web::post().to(test_switch))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET, Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
    }
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
struct MemoryUsage {
    rss: u64,
    vms: u64,
}

async fn index(state: web::Data<AppState>) -> impl Responder {
    web::Json(json!({
        "message": "Raspberry Pi GPIO Controller",
        "version": env!("CARGO_PKG_VERSION"),
        "device_id": state.config.api.device_id,
        "switches": state.config.pins.switch_pins.len(),
        "bulbs": state.config.pins.bulb_pins.len(),
        "status": "running",
        "timestamp": chrono::Local::now().to_rfc3339(),
    }))
}

async fn health(state: web::Data<AppState>) -> impl Responder {
    let memory = tokio::fs::read_to_string(PROC_SELF_STATUS)
        .await
        .map(|text| parse_memory_usage(&text))
        .unwrap_or_default();

    web::Json(json!({
        "status": "healthy",
        "timestamp": chrono::Local::now().to_rfc3339(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "memory": memory,
    }))
}

async fn status(state: web::Data<AppState>) -> impl Responder {
    web::Json(state.controller.status())
}

async fn test_switch(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let index = parse_switch_index(&req);
    info!("Test request for switch {index}");

    let result = state.controller.handle_switch_press(index).await?;

    Ok(web::Json(json!({
        "message": format!("Switch {index} test completed"),
        "result": result,
    })))
}

// a non-numeric index is reported like any other out-of-range one
fn parse_switch_index(req: &HttpRequest) -> usize {
    req.match_info()
        .get("index")
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .unwrap_or(0)
}

/// Reads `VmRSS` and `VmSize` (reported in kB) as bytes.
fn parse_memory_usage(status: &str) -> MemoryUsage {
    let mut usage = MemoryUsage::default();
    for line in status.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let kb = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        match key {
            "VmRSS" => usage.rss = kb.saturating_mul(1024),
            "VmSize" => usage.vms = kb.saturating_mul(1024),
            _ => {}
        }
    }
    usage
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_usage_from_proc_status() {
        let text = "Name:\tswgate\nVmSize:\t  20480 kB\nVmRSS:\t    1024 kB\nThreads:\t4\n";
        assert_eq!(
            parse_memory_usage(text),
            MemoryUsage {
                rss: 1024 * 1024,
                vms: 20480 * 1024
            }
        );
        assert_eq!(parse_memory_usage("garbage"), MemoryUsage::default());
    }

    #[test]
    fn oversized_memory_values_saturate() {
        let text = format!("VmRSS:\t{} kB\nVmSize:\tlots kB\n", u64::MAX);
        assert_eq!(
            parse_memory_usage(&text),
            MemoryUsage {
                rss: u64::MAX,
                vms: 0
            }
        );
    }
}
