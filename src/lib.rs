pub mod audit;
pub mod differ;
pub mod error;
pub mod intake;
pub mod record;
pub mod request;
pub mod resolution;
pub mod service;
pub mod store;
pub mod utils;
