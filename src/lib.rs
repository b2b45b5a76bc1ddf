pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod leader;
pub mod manifests;
pub mod node;
pub mod shutdown;
