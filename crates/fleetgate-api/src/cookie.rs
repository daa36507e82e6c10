//! Identity cookies shared by every proxy subdomain.

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};

pub const PUBLIC_KEY_ID_COOKIE: &str = "public-key-id";
pub const SIGNATURE_COOKIE: &str = "public-key-id-signature-base64";

const EXPIRED: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// The two identity cookies of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCookies {
    pub public_key_id: String,
    pub signature_base64: String,
}

/// Read both identity cookies. `None` unless both are present and
/// non-empty.
pub fn identity_cookies(headers: &HeaderMap) -> Option<IdentityCookies> {
    let mut public_key_id = None;
    let mut signature_base64 = None;

    for value in headers.get_all(COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let Some((name, val)) = pair.trim().split_once('=') else {
                continue;
            };
            let val = val.trim().trim_matches('"');
            if val.is_empty() {
                continue;
            }
            match name.trim() {
                PUBLIC_KEY_ID_COOKIE => public_key_id = Some(val.to_string()),
                SIGNATURE_COOKIE => signature_base64 = Some(val.to_string()),
                _ => {}
            }
        }
    }

    Some(IdentityCookies {
        public_key_id: public_key_id?,
        signature_base64: signature_base64?,
    })
}

fn cookie(name: &str, value: &str, domain: &str, expires: Option<&str>) -> String {
    let mut c = format!("{name}={value}; Path=/");
    if !domain.is_empty() {
        c.push_str("; Domain=");
        c.push_str(domain);
    }
    if let Some(expires) = expires {
        c.push_str("; Max-Age=0; Expires=");
        c.push_str(expires);
    }
    c.push_str("; HttpOnly; Secure; SameSite=Strict");
    c
}

/// Append `Set-Cookie` headers establishing a session.
///
/// Fails if a value cannot be carried in a header.
pub fn set_identity_cookies(
    headers: &mut HeaderMap,
    domain: &str,
    cookies: &IdentityCookies,
) -> Result<(), axum::http::header::InvalidHeaderValue> {
    for (name, value) in [
        (PUBLIC_KEY_ID_COOKIE, cookies.public_key_id.as_str()),
        (SIGNATURE_COOKIE, cookies.signature_base64.as_str()),
    ] {
        let header = HeaderValue::from_str(&cookie(name, value, domain, None))?;
        headers.append(SET_COOKIE, header);
    }
    Ok(())
}

/// Append `Set-Cookie` headers that expire both identity cookies.
pub fn revoke_identity_cookies(
    headers: &mut HeaderMap,
    domain: &str,
) -> Result<(), axum::http::header::InvalidHeaderValue> {
    for name in [PUBLIC_KEY_ID_COOKIE, SIGNATURE_COOKIE] {
        let header = HeaderValue::from_str(&cookie(name, "", domain, Some(EXPIRED)))?;
        headers.append(SET_COOKIE, header);
    }
    Ok(())
}

/// Cookie values must be header-safe and free of separators.
pub fn valid_cookie_value(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_graphic() && !matches!(b, b';' | b',' | b'"' | b'\\'))
}
