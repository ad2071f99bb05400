//! Parsed server responses.

use rmpv::Value;

use crate::consts::ResponseCode;

/// Decoded response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Success or raw server error code.
    pub code: ResponseCode,
    /// Sync tag of the request this response answers.
    pub sync: u64,
    /// Server-side schema version at the time of the response.
    pub schema_id: u32,
}

/// A fully decoded response frame.
///
/// When `header.code` is an error the error message is present and `data`
/// is absent; on success `error` is absent and `data` holds the returned
/// tuples, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub header: Header,
    pub data: Option<Vec<Value>>,
    pub error: Option<String>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.header.code.is_ok()
    }

    pub fn is_error(&self) -> bool {
        !self.is_ok()
    }

    pub fn sync(&self) -> u64 {
        self.header.sync
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Consumes the response, returning its data tuples (empty when the
    /// server sent no body).
    pub fn into_data(self) -> Vec<Value> {
        self.data.unwrap_or_default()
    }
}
