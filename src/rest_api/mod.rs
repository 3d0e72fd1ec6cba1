//! HTTP endpoints for probes and Prometheus scraping

mod server;

pub use server::{router, run_server};
