use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::ApiError;

/// Successful API response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiSuccess {
    pub status: u16,
    pub data: Value,
}

/// Render a request result as the `{success, data?, error?, status?}`
/// envelope the applications consume
pub fn envelope(result: &Result<ApiSuccess, ApiError>) -> Value {
    let mut body = Map::new();
    match result {
        Ok(success) => {
            body.insert("success".to_string(), json!(true));
            body.insert("data".to_string(), success.data.clone());
        }
        Err(err) => {
            body.insert("success".to_string(), json!(false));
            body.insert("error".to_string(), err.payload());
            body.insert("status".to_string(), json!(err.status()));
        }
    }
    Value::Object(body)
}
