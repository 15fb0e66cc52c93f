//! Backend-selection and dispatch core plus the surrounding gateway
//! ambient stack (config, discovery, proxy, server, metrics).
//!
//! `address`, `failure`, `selector`, `balancer_map`, `sticky_cache`,
//! `stock`, `balancer_request`, and `monitor` are the free-standing
//! building blocks of backend selection; `upstream::cluster` is where
//! they are wired together per named cluster.

pub mod address;
pub mod balancer_map;
pub mod balancer_request;
pub mod config;
pub mod discovery;
pub mod error;
pub mod etcd;
pub mod failure;
pub mod metrics;
pub mod monitor;
pub mod proxy;
pub mod routing;
pub mod selector;
pub mod server;
pub mod stock;
pub mod sticky;
pub mod sticky_cache;
pub mod upstream;
