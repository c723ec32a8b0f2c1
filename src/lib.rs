pub mod admission;
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod model;
pub mod roster;
pub mod server;
pub mod uploads;
