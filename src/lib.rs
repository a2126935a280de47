pub mod config;
pub mod db;
pub mod discord;
pub mod github;
pub mod model;
pub mod reconciler;
pub mod scheduler;
