//! Success envelope helpers. Every 2xx body is `{"data": ...}` with an
//! optional `meta` object; errors render through `crate::error::Error`.

use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

pub fn data<T: Serialize>(value: T) -> Json<Value> {
    Json(json!({ "data": value }))
}

pub fn data_with_meta<T: Serialize, M: Serialize>(value: T, meta: M) -> Json<Value> {
    Json(json!({ "data": value, "meta": meta }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_envelope_shape() {
        let Json(body) = data(vec![1, 2, 3]);
        assert_eq!(body["data"], json!([1, 2, 3]));
        assert!(body.get("meta").is_none());
    }

    #[test]
    fn test_meta_envelope_shape() {
        let Json(body) = data_with_meta(json!({"id": 1}), json!({"created": true}));
        assert_eq!(body["data"]["id"], 1);
        assert_eq!(body["meta"]["created"], true);
    }
}
