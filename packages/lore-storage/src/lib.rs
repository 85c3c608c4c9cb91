pub mod analytics;
pub mod db;
pub mod insights;
pub mod jobs;
pub mod memories;
pub mod models;
pub mod schema;

mod error;

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
