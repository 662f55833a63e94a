//! DNS Sinkhole Library
//!
//! This library provides a filtering DNS resolver. Queries for names on a
//! blocklist are answered locally with a sinkhole address; everything else
//! is relayed to an upstream resolver. Every decoded query is recorded in
//! an audit trail.

// Define modules
pub mod audit;
pub mod bloom;
pub mod config;
pub mod db;
pub mod dns;
pub mod errors;
pub mod handlers;
pub mod index;
pub mod normalize;
pub mod upstream;

// Re-export commonly used items
pub use config::ServerConfig;
pub use errors::DnsError;
pub use handlers::QueryHandler;
pub use index::{ActiveIndex, MembershipIndex};
