//! Health and metrics endpoints.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

/// `GET /health` — liveness plus a compact status summary.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "stt-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "models": {
            "default_size": config.models.model_size
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "active_streams": metrics.active_streams
        }
    }))
}

/// `GET /api/v1/metrics` — per-endpoint statistics and process memory.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoints = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoints.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms()
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_streams": metrics.active_streams,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoints,
        "memory": memory_info()
    }))
}

/// Resident/virtual memory of this process, when the platform exposes it.
fn memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0u64;
            let mut vm_size = 0u64;

            for line in status.lines() {
                let kb = |l: &str| {
                    l.split_whitespace()
                        .nth(1)
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0)
                        * 1024
                };
                if line.starts_with("VmRSS:") {
                    vm_rss = kb(line);
                } else if line.starts_with("VmSize:") {
                    vm_size = kb(line);
                }
            }

            return json!({
                "resident_bytes": vm_rss,
                "virtual_bytes": vm_size,
                "available": true
            });
        }
    }

    let _ = process::id();
    json!({ "available": false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_health_reports_ok() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let response = health_check(state).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::OK);

        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"]["name"], "stt-backend");
    }

    #[actix_web::test]
    async fn test_metrics_include_recorded_endpoints() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        state.record_endpoint_request("POST /transcribe", 42, false);

        let response = detailed_metrics(state).await;
        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        let endpoints = json["endpoints"].as_array().unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0]["endpoint"], "POST /transcribe");
    }
}
