mod routes;

pub mod app;
pub mod config;
pub mod cv_utils;
pub mod lifecycle;
pub mod server;
pub mod session;
pub mod stream;
pub mod telemetry;

pub use app::start_app;
