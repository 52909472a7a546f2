//! imagens: image upload backend, edge proxy and container entrypoint.
//!
//! The binary exposes one subcommand per runtime component:
//! - `serve`     — the upload backend (`routes`, `handlers`, `services`)
//! - `proxy`     — the public edge proxy (`proxy`)
//! - `supervise` — the entrypoint that launches and watches both (`supervisor`)

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod proxy;
pub mod routes;
pub mod services;
pub mod shutdown;
pub mod state;
pub mod supervisor;
