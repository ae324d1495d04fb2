// Data models for requests and responses

pub mod request;
pub mod response;

pub use request::{Method, RequestDescriptor};
pub use response::{envelope, ApiSuccess};
