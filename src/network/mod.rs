//! Network module - TCP links between the controller and its renderers
//!
//! Provides:
//! - Datagram framing and queued connections
//! - The renderer endpoint (listens, applies camera state, answers swaps)
//! - The controller endpoint (connects to every renderer, drives frames)

mod connection;
mod controller;
mod renderer;

pub use connection::*;
pub use controller::*;
pub use renderer::*;

use std::net::SocketAddr;

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

/// Resolve `host` or `host:port`, falling back to `default_port`
pub async fn resolve_endpoint(endpoint: &str, default_port: u16) -> std::io::Result<SocketAddr> {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok(addr);
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse::<u16>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Invalid port in {}", endpoint),
                )
            })?;
            resolve_host(host, port).await
        }
        _ => resolve_host(endpoint, default_port).await,
    }
}
