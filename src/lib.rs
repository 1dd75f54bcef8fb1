pub mod config;
pub mod db;
pub mod directory;
pub mod dispatch;
pub mod engine;
pub mod lifecycle;
pub mod model;
pub mod render;
pub mod resolver;
pub mod scheduler;
pub mod transport;
