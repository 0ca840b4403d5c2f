pub mod config;
pub mod health;
pub mod history;
pub mod ws;
