pub mod app_state;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod handlers;
pub mod hub;
pub mod middleware;
pub mod liveness;
pub mod models;
pub mod persistence;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod websocket;
