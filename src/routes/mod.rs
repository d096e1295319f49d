// API route modules, one per surface.

pub mod admin;
pub mod agent;
pub mod audit;
pub mod auth;
pub mod certificates;
pub mod devices;
pub mod install_jobs;

use axum::extract::ConnectInfo;
use std::net::SocketAddr;

/// Client IP for audit rows; absent when the server runs without connect info
/// (router-level tests).
pub(crate) fn client_ip(connect_info: &Option<ConnectInfo<SocketAddr>>) -> Option<String> {
    connect_info
        .as_ref()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}
