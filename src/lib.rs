// Intake API client - library root

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod http_client;
pub mod models;
pub mod transport;

pub use error::{ApiError, RefreshError};
pub use http_client::AuthenticatedRequestClient;
pub use models::{ApiSuccess, Method, RequestDescriptor};
