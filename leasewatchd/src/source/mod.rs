pub mod client;
pub mod types;

pub use client::{DnsSource, TechnitiumClient};
