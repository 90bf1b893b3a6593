// Library exports for the CLI and for services that consume tenant handles
pub mod config;
pub mod db;
pub mod models;
pub mod services;
