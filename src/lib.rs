//! Kubernetes operator bridging Agones GameServers, Cilium LB-IPAM Services
//! and Cilium egress gateway policies

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod rest_api;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `default_directive`.
pub fn init_tracing(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}
