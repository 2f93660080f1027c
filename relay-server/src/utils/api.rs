use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An error body returned from or sent to an HTTP api.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    causes: Vec<String>,
}

impl ApiErrorResponse {
    /// Creates an error response with a detail message.
    pub fn with_detail<S: AsRef<str>>(s: S) -> Self {
        Self {
            detail: Some(s.as_ref().to_owned()),
            causes: Vec::new(),
        }
    }

    /// Creates an error response from an error, including its source chain.
    pub fn from_error<E: Error + ?Sized>(error: &E) -> Self {
        let mut causes = Vec::new();

        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            detail: Some(error.to_string()),
            causes,
        }
    }
}

impl fmt::Display for ApiErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => f.write_str(detail),
            None => f.write_str("no error details"),
        }
    }
}

impl Error for ApiErrorResponse {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("inner failure")]
    struct InnerError;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct OuterError(#[source] InnerError);

    #[test]
    fn test_from_error_chain() {
        let response = ApiErrorResponse::from_error(&OuterError(InnerError));
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"detail":"outer failure","causes":["inner failure"]}"#);
    }
}
