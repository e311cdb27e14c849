//! Avatar uploads for the scheduling backend.
//!
//! Clients upload straight to object storage with a short-lived credential;
//! this crate issues those credentials and reconciles finished uploads with
//! the user record.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod storage;

use axum::Router;
use state::AppState;

/// The application router with state attached.
pub fn app(state: AppState) -> Router {
    routes::routes::routes(&state.avatars.settings).with_state(state)
}
