pub mod client;
pub mod group;

pub use client::DiscoveryClient;
pub use group::ServiceGroup;
