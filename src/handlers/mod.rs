//! Request handlers for different server endpoints

pub mod health;
pub mod websocket;

use std::convert::Infallible;
use warp::Filter;

use crate::constants::WS_PATH;
use crate::core::server::SharedRelayServer;

pub use websocket::handle_ws_client;

/// All routes served by the relay: `/ws`, `/health` and `/stats`
pub fn routes(
    server: SharedRelayServer,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let ws_route = warp::path(WS_PATH)
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_server(server.clone()))
        .map(|ws: warp::ws::Ws, server: SharedRelayServer| {
            log::debug!("New websocket upgrade request");
            ws.on_upgrade(move |socket| handle_ws_client(socket, server))
        });

    let health_route = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(health::health_handler);

    let stats_route = warp::path("stats")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server))
        .and_then(health::stats_handler);

    ws_route.or(health_route).or(stats_route)
}

// Helper function to include server state in request
fn with_server(
    server: SharedRelayServer,
) -> impl Filter<Extract = (SharedRelayServer,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}
