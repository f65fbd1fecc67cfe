//! Request ID generation for log correlation.

use uuid::Uuid;

/// Response header carrying the request ID back to the caller.
pub const REQUEST_ID_HEADER: &str = "x-relay-request-id";

/// Generate a new request ID (UUID v4).
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
