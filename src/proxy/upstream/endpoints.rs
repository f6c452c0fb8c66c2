pub const METHOD_GENERATE_CONTENT: &str = "generateContent";
pub const METHOD_STREAM_GENERATE_CONTENT: &str = "streamGenerateContent";
pub const METHOD_LOAD_CODE_ASSIST: &str = "loadCodeAssist";
pub const METHOD_FETCH_AVAILABLE_MODELS: &str = "fetchAvailableModels";

pub const SSE_QUERY: &str = "alt=sse";

// Base URLs already carry the `/v1internal` prefix; Cloud Code methods hang
// off it with a colon, e.g. `.../v1internal:streamGenerateContent?alt=sse`.
pub fn build_method_url(base_url: &str, method: &str, query: Option<&str>) -> String {
    match query {
        Some(qs) if !qs.trim().is_empty() => format!("{}:{}?{}", base_url, method, qs),
        _ => format!("{}:{}", base_url, method),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_content_url_has_no_query() {
        assert_eq!(
            build_method_url(
                "https://cloudcode-pa.googleapis.com/v1internal",
                METHOD_GENERATE_CONTENT,
                None
            ),
            "https://cloudcode-pa.googleapis.com/v1internal:generateContent"
        );
    }

    #[test]
    fn stream_url_carries_sse_query() {
        assert_eq!(
            build_method_url(
                "https://cloudcode-pa.googleapis.com/v1internal",
                METHOD_STREAM_GENERATE_CONTENT,
                Some(SSE_QUERY)
            ),
            "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn blank_query_is_ignored() {
        assert_eq!(
            build_method_url("http://127.0.0.1:1/v1internal", METHOD_LOAD_CODE_ASSIST, Some(" ")),
            "http://127.0.0.1:1/v1internal:loadCodeAssist"
        );
    }
}
