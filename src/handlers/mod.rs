pub mod auth;
pub mod avatar_handlers;
pub mod health_handlers;
pub mod storage_handlers;
