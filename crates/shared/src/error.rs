use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Conflict,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            400 | 422 => Self::Validation,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            _ => Self::Internal,
        }
    }
}

/// Error body returned by the CRM backend. Only `detail` is contractual; field
/// errors from form validation are kept as raw JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ApiErrorBody {
    pub fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_detail_and_keeps_field_errors() {
        let body = ApiErrorBody::parse(r#"{"detail":"Stage belongs to a different pipeline"}"#);
        assert_eq!(
            body.detail.as_deref(),
            Some("Stage belongs to a different pipeline")
        );

        let body = ApiErrorBody::parse(r#"{"stage_id":["This field is required."]}"#);
        assert!(body.detail.is_none());
        assert!(body.fields.contains_key("stage_id"));
    }

    #[test]
    fn non_json_body_has_no_detail() {
        assert!(ApiErrorBody::parse("<html>502</html>").detail.is_none());
    }
}
