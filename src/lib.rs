pub mod adapters;
pub mod app;
pub mod catalog;
pub mod config;
pub mod coordination;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod objectstore;
pub mod pricing;
pub mod reconcile;
pub mod relay;
pub mod ticket;
pub mod usage;
pub mod wallet;
