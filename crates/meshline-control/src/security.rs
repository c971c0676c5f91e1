use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const SIGNATURE_HEADER: &str = "x-meshline-signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

pub fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (code, axum::Json(ErrorBody { message: message.into() })).into_response()
}

#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
}

// Middleware: reuse the caller's request id when it looks sane, otherwise mint
// one. Echoed on every response.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestMeta {
        request_id: request_id.clone(),
    });
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}

/// Hex HMAC-SHA256 of `body`, the value senders put in the signature header.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Accepts `<hex>` or `sha256=<hex>`. Comparison is constant time.
pub fn verify_signature(secret: &[u8], headers: &HeaderMap, body: &[u8]) -> bool {
    let Some(raw) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let raw = raw.trim();
    let hex_sig = raw.strip_prefix("sha256=").unwrap_or(raw);
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
