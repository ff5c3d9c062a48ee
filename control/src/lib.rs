//! Control plane for a fleet of proxy nodes.
//!
//! [`fleet::Fleet`] wires the services together: node transports, the tiered
//! cache, load balancing, monitoring with alert history, traffic accounting
//! and the certificate authority behind the control plane's mTLS identity.

pub mod alerts;
pub mod api;
pub mod balancer;
pub mod cache;
pub mod certs;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod fleet;
pub mod jobs;
pub mod logging;
pub mod monitor;
pub mod node_cache;
pub mod node_client;
pub mod node_manager;
pub mod tls;
pub mod traffic;
pub mod types;
