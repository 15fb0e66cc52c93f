pub mod client;
pub mod registry;
pub mod zeroconf;

pub use client::{ConsulClient, ConsulServiceNode};
pub use registry::ConsulRegistry;
pub use zeroconf::ZeroconfExplorer;
