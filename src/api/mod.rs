pub mod chat;
pub mod control;
pub mod health;
pub mod models;
