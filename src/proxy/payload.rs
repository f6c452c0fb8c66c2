use serde_json::{json, Value};

use crate::error::{AppError, AppResult};

// Seam for the external request/response translation layer. The core only
// needs an upstream body for `(request, project, model)` and the inverse
// unwrap for non-streaming replies.
pub trait PayloadBuilder: Send + Sync {
    fn build(&self, request: &Value, project_id: &str, model: &str) -> AppResult<Value>;

    fn translate_response(&self, upstream: Value) -> AppResult<Value> {
        Ok(upstream)
    }
}

// Default builder: wraps the client request in the Cloud Code envelope and
// unwraps the `response` field on the way back. Format conversion beyond the
// envelope belongs to the hosting layer.
pub struct CloudCodePayloadBuilder;

impl PayloadBuilder for CloudCodePayloadBuilder {
    fn build(&self, request: &Value, project_id: &str, model: &str) -> AppResult<Value> {
        if !request.is_object() {
            return Err(AppError::Upstream(
                "request payload must be a JSON object".to_string(),
            ));
        }
        Ok(json!({
            "project": project_id,
            "model": model,
            "request": request,
        }))
    }

    fn translate_response(&self, upstream: Value) -> AppResult<Value> {
        match upstream {
            Value::Object(mut map) => match map.remove("response") {
                Some(inner) => Ok(inner),
                None => Ok(Value::Object(map)),
            },
            other => Ok(other),
        }
    }
}
