pub mod config;
pub mod http;
pub mod relay;
pub mod security;
pub mod session;
