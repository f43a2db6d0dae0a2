//! Web server module for Parley.

pub mod cors;
pub mod server;
pub mod ws;

pub use server::WebServer;
