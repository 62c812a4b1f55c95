//! HTTP status endpoints

use serde_json::json;
use std::convert::Infallible;

use crate::core::server::SharedRelayServer;
use crate::security::headers::with_api_headers;

/// `GET /health`
pub async fn health_handler(server: SharedRelayServer) -> Result<impl warp::Reply, Infallible> {
    let report = server.health().await;
    Ok(with_api_headers(warp::reply::json(&report)))
}

/// `GET /stats`
pub async fn stats_handler(server: SharedRelayServer) -> Result<impl warp::Reply, Infallible> {
    let stats = server.registry().stats().await;
    Ok(with_api_headers(warp::reply::json(&json!({
        "success": true,
        "data": stats,
    }))))
}
