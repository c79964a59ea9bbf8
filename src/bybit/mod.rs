pub mod rest;
pub mod stream;

pub use rest::BybitClient;
