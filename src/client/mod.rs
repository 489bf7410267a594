pub mod client;
pub mod config;

pub use self::client::run_client;
