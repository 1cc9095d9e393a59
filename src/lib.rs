pub mod config;
pub mod errors;
pub mod handlers;
pub mod mcp;
pub mod routes;
pub mod services;
pub mod state;
