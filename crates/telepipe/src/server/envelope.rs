//! The `{code, messageText, data}` response envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Result codes carried in the envelope's `code` field.
///
/// Values below 1000 mirror HTTP statuses; 1000 and above are business
/// errors returned with HTTP 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ResponseCode {
    /// Request handled.
    Success,
    /// Malformed request.
    BadRequest,
    /// Missing credentials.
    Unauthorized,
    /// Credentials not allowed.
    Forbidden,
    /// Nothing at this key.
    NotFound,
    /// Rate limited.
    TooManyRequests,
    /// Unexpected server failure.
    InternalError,
    /// Endpoint not implemented.
    NotImplemented,
    /// Upstream failure.
    BadGateway,
    /// Generic business error.
    BusinessError,
    /// No payload in the request could be decrypted.
    DecodeFailure,
    /// A decrypted event failed validation.
    InvalidEvent,
    /// The server holds no key material.
    KeyNotProvisioned,
}

impl ResponseCode {
    /// Every code in the table.
    pub const ALL: [ResponseCode; 13] = [
        Self::Success,
        Self::BadRequest,
        Self::Unauthorized,
        Self::Forbidden,
        Self::NotFound,
        Self::TooManyRequests,
        Self::InternalError,
        Self::NotImplemented,
        Self::BadGateway,
        Self::BusinessError,
        Self::DecodeFailure,
        Self::InvalidEvent,
        Self::KeyNotProvisioned,
    ];

    /// Numeric code.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Success => 200,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::TooManyRequests => 429,
            Self::InternalError => 500,
            Self::NotImplemented => 501,
            Self::BadGateway => 502,
            Self::BusinessError => 1000,
            Self::DecodeFailure => 1001,
            Self::InvalidEvent => 1002,
            Self::KeyNotProvisioned => 1003,
        }
    }

    /// Look up a numeric code.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Default message text for this code.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::BadRequest => "bad request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not found",
            Self::TooManyRequests => "too many requests",
            Self::InternalError => "internal server error",
            Self::NotImplemented => "not implemented",
            Self::BadGateway => "bad gateway",
            Self::BusinessError => "business error",
            Self::DecodeFailure => "payload could not be decoded",
            Self::InvalidEvent => "event failed validation",
            Self::KeyNotProvisioned => "key material not provisioned",
        }
    }

    /// Whether this is the success code.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Whether this is a business error (code 1000 or above).
    #[must_use]
    pub fn is_business(self) -> bool {
        self.code() >= 1000
    }

    /// HTTP status the envelope travels with.
    #[must_use]
    pub fn http_status(self) -> StatusCode {
        if self.is_business() {
            StatusCode::OK
        } else {
            StatusCode::from_u16(self.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

impl TryFrom<u16> for ResponseCode {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown response code {code}"))
    }
}

impl From<ResponseCode> for u16 {
    fn from(code: ResponseCode) -> Self {
        code.code()
    }
}

/// The response body shape shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    /// Numeric result code.
    pub code: u16,
    /// Human-readable message; the code's default unless overridden.
    pub message_text: String,
    /// Payload, or `null`.
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    /// Successful envelope carrying `data`.
    #[must_use]
    pub fn success(data: T) -> Self {
        Self::with_data(ResponseCode::Success, data)
    }

    /// Envelope with the given code and data, using the default message.
    #[must_use]
    pub fn with_data(code: ResponseCode, data: T) -> Self {
        Self {
            code: code.code(),
            message_text: code.message().to_string(),
            data: Some(data),
        }
    }

    /// Envelope with no data, using the code's default message.
    #[must_use]
    pub fn from_code(code: ResponseCode) -> Self {
        Self {
            code: code.code(),
            message_text: code.message().to_string(),
            data: None,
        }
    }

    /// Replace the default message text.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message_text = message.into();
        self
    }

    /// The code as a table entry, if known.
    #[must_use]
    pub fn response_code(&self) -> Option<ResponseCode> {
        ResponseCode::from_code(self.code)
    }

    /// Whether the code is 200.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == ResponseCode::Success.code()
    }
}

impl Envelope<()> {
    /// Successful envelope with `data: null`.
    #[must_use]
    pub fn ok() -> Self {
        Self::from_code(ResponseCode::Success)
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        let status = self
            .response_code()
            .map_or(StatusCode::INTERNAL_SERVER_ERROR, ResponseCode::http_status);
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_table() {
        let codes: Vec<u16> = ResponseCode::ALL.iter().map(|c| c.code()).collect();
        assert_eq!(
            codes,
            vec![200, 400, 401, 403, 404, 429, 500, 501, 502, 1000, 1001, 1002, 1003]
        );
        for code in ResponseCode::ALL {
            assert_eq!(ResponseCode::from_code(code.code()), Some(code));
            assert!(!code.message().is_empty());
        }
        assert_eq!(ResponseCode::from_code(418), None);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ResponseCode::Success.http_status(), StatusCode::OK);
        assert_eq!(ResponseCode::NotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ResponseCode::TooManyRequests.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ResponseCode::DecodeFailure.http_status(), StatusCode::OK);
        assert!(ResponseCode::KeyNotProvisioned.is_business());
        assert!(!ResponseCode::BadGateway.is_business());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let json = serde_json::to_value(Envelope::ok()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"code": 200, "messageText": "success", "data": null})
        );

        let json = serde_json::to_value(Envelope::success(vec![1, 2])).unwrap();
        assert_eq!(json["data"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_message_override() {
        let env: Envelope<()> =
            Envelope::from_code(ResponseCode::BadRequest).with_message("missing payloads");
        assert_eq!(env.code, 400);
        assert_eq!(env.message_text, "missing payloads");
        assert!(!env.is_success());
    }

    #[test]
    fn test_envelope_parses_unknown_code() {
        let env: Envelope<serde_json::Value> =
            serde_json::from_str(r#"{"code":777,"messageText":"odd","data":null}"#).unwrap();
        assert_eq!(env.response_code(), None);
        assert!(!env.is_success());
    }

    #[test]
    fn test_response_code_serde() {
        let code: ResponseCode = serde_json::from_str("1001").unwrap();
        assert_eq!(code, ResponseCode::DecodeFailure);
        assert!(serde_json::from_str::<ResponseCode>("999").is_err());
    }
}
