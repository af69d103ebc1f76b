pub mod config;
pub mod error;
pub mod model;
pub mod normalizer;
pub mod notifier;
pub mod reminder;
pub mod store;
pub mod worker;
