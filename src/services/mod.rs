pub mod avatar_service;
pub mod promotion;
