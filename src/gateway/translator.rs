//! Normalization of API and transport failures into [`DomainError`].

use serde_json::Value;

use super::error::{DomainError, GatewayError};

/// Converts a caught error into a [`DomainError`].
///
/// - A structured API error response keeps its status as the code and takes
///   its message from `rsp_msg` (or the raw text body).
/// - A transport failure without a response becomes a `NETWORK` error.
/// - Anything else is handed back unchanged in the `Err` variant.
///
/// # Example
///
/// ```rust
/// use market_gateway::{GatewayError, to_domain_error};
/// use serde_json::json;
///
/// let caught = GatewayError::Api {
///     status: 404,
///     payload: json!({"rsp_cd": "01404", "rsp_msg": "no such item"}),
/// };
/// let domain = to_domain_error(caught).unwrap();
/// assert_eq!(domain.code, "404");
/// assert_eq!(domain.message, "no such item");
/// ```
pub fn to_domain_error(caught: GatewayError) -> Result<DomainError, GatewayError> {
    match caught {
        GatewayError::Domain(domain) => Ok(domain),
        GatewayError::Api { status, payload } => Ok(from_api_response(status, payload)),
        GatewayError::Transport(err) => {
            if let Some(status) = err.status() {
                Ok(DomainError::new(status.as_u16().to_string(), err.to_string()))
            } else if err.is_timeout() || err.is_connect() || err.is_request() {
                Ok(DomainError::network())
            } else {
                Err(GatewayError::Transport(err))
            }
        }
        other => Err(other),
    }
}

/// Like [`to_domain_error`] but always yields a `GatewayError`, wrapping
/// translated errors in [`GatewayError::Domain`].
pub fn translate(caught: GatewayError) -> GatewayError {
    match to_domain_error(caught) {
        Ok(domain) => GatewayError::Domain(domain),
        Err(untranslated) => untranslated,
    }
}

fn from_api_response(status: u16, payload: Value) -> DomainError {
    let message = match &payload {
        Value::Object(map) => map
            .get("rsp_msg")
            .and_then(Value::as_str)
            .map(|msg| msg.trim().to_string()),
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    }
    .unwrap_or_else(|| format!("API responded with status {status}"));

    DomainError::new(status.to_string(), message).with_payload(payload)
}
