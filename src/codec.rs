//! JSON codec for typed orchestration inputs and outputs.
//!
//! Histories store plain strings; orchestrations that work with structured
//! values encode and decode at the boundary through this module. Errors are
//! strings so they can flow straight into an orchestration's `Err`.

use serde::de::DeserializeOwned;
use serde::Serialize;

pub trait Codec {
    fn encode<T: Serialize>(v: &T) -> Result<String, String>;
    fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
}

pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        serde_json::to_string(v).map_err(|e| format!("encode: {e}"))
    }

    fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        serde_json::from_str(s).map_err(|e| format!("decode: {e}"))
    }
}
