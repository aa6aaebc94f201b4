pub mod authorization;
pub mod catalog;
pub mod config;
pub mod context;
pub mod data_types;
pub mod error;
pub mod gc;
pub mod identifier;
pub mod lock;
pub mod meta;
pub mod metalake;
pub mod principal;
pub mod repository;
pub mod store;
