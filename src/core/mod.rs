pub mod credentials;
pub mod filename;
pub mod models;
pub mod utils;
