pub mod api;
pub mod catalog;
pub mod config;
pub mod geometry;
pub mod matcher;
pub mod nms;
pub mod pipeline;
pub mod runner;
pub mod state;
pub mod template;
pub mod types;
