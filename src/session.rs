//! Per-request session state carried in cookies: flash messages and the
//! CSRF token.

use axum::http::{HeaderMap, HeaderValue, header::COOKIE};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const FLASH_COOKIE: &str = "flash";
pub const CSRF_COOKIE: &str = "csrf_token";
pub const CSRF_FIELD_NAME: &str = "csrf_token";
pub const REALM_COOKIE: &str = "realm";

const CSRF_TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashLevel {
    Error,
    Warning,
    Alert,
}

impl FlashLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            FlashLevel::Error => "error",
            FlashLevel::Warning => "warning",
            FlashLevel::Alert => "alert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashMessage {
    pub level: FlashLevel,
    pub message: String,
}

/// User-facing notices.
///
/// Messages added with `error`, `warning` or `alert` are written to the
/// flash cookie and shown on the next request. The `*_now` variants only
/// appear in the response being built. Messages read from an incoming
/// cookie are shown by the next [`Flash::render`]; until then they are
/// written back to the cookie, so a redirect does not lose them.
#[derive(Debug, Default)]
pub struct Flash {
    current: Vec<FlashMessage>,
    pending: Vec<FlashMessage>,
    incoming: usize,
    rendered: bool,
    consumed_cookie: bool,
}

impl Flash {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut flash = Self::default();
        if let Some(raw) = cookie_value(headers, FLASH_COOKIE) {
            flash.consumed_cookie = true;
            flash.current = decode_messages(raw).unwrap_or_default();
            flash.incoming = flash.current.len();
        }
        flash
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.persist(FlashLevel::Error, message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.persist(FlashLevel::Warning, message.into());
    }

    pub fn alert(&mut self, message: impl Into<String>) {
        self.persist(FlashLevel::Alert, message.into());
    }

    pub fn error_now(&mut self, message: impl Into<String>) {
        self.show(FlashLevel::Error, message.into());
    }

    pub fn warning_now(&mut self, message: impl Into<String>) {
        self.show(FlashLevel::Warning, message.into());
    }

    pub fn alert_now(&mut self, message: impl Into<String>) {
        self.show(FlashLevel::Alert, message.into());
    }

    /// Messages to display in this response.
    pub fn current(&self) -> &[FlashMessage] {
        &self.current
    }

    /// Messages that will be stored for the next request.
    pub fn pending(&self) -> &[FlashMessage] {
        &self.pending
    }

    /// Hands the current messages to a rendered page. Incoming messages are
    /// not carried over once rendered.
    pub fn render(&mut self) -> Vec<FlashMessage> {
        self.rendered = true;
        self.current.clone()
    }

    pub fn current_errors(&self) -> impl Iterator<Item = &str> {
        self.current
            .iter()
            .filter(|msg| msg.level == FlashLevel::Error)
            .map(|msg| msg.message.as_str())
    }

    /// The `Set-Cookie` value this flash needs on the response, if any.
    pub fn set_cookie(&self, secure: bool) -> Option<HeaderValue> {
        let unrendered = if self.rendered { 0 } else { self.incoming };
        let stored: Vec<FlashMessage> = self
            .current
            .iter()
            .take(unrendered)
            .chain(&self.pending)
            .cloned()
            .collect();

        if !stored.is_empty() {
            let encoded = encode_messages(&stored)?;
            return HeaderValue::from_str(&session_cookie(FLASH_COOKIE, &encoded, secure)).ok();
        }
        if self.consumed_cookie {
            return HeaderValue::from_str(&expired_cookie(FLASH_COOKIE, secure)).ok();
        }
        None
    }

    fn persist(&mut self, level: FlashLevel, message: String) {
        self.pending.push(FlashMessage { level, message });
    }

    fn show(&mut self, level: FlashLevel, message: String) {
        self.current.push(FlashMessage { level, message });
    }
}

fn encode_messages(messages: &[FlashMessage]) -> Option<String> {
    serde_json::to_vec(messages)
        .ok()
        .map(|json| URL_SAFE_NO_PAD.encode(json))
}

fn decode_messages(raw: &str) -> Option<Vec<FlashMessage>> {
    let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Hidden form field that carries the CSRF token in templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CsrfField {
    pub name: &'static str,
    pub value: String,
}

impl CsrfField {
    pub fn hidden_input(&self) -> String {
        format!(
            "<input type=\"hidden\" name=\"{}\" value=\"{}\" />",
            self.name,
            html_escape::encode_double_quoted_attribute(&self.value)
        )
    }
}

/// Double-submit CSRF token: the cookie value must come back in the form.
#[derive(Debug, Clone)]
pub struct CsrfToken {
    value: String,
    issued: bool,
}

impl CsrfToken {
    /// Reuses the token from the request cookie, or issues a new one.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        match cookie_value(headers, CSRF_COOKIE).filter(|raw| is_well_formed_token(raw)) {
            Some(raw) => Self {
                value: raw.to_owned(),
                issued: false,
            },
            None => Self::generate(),
        }
    }

    fn generate() -> Self {
        let mut bytes = [0u8; CSRF_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            value: URL_SAFE_NO_PAD.encode(bytes),
            issued: true,
        }
    }

    pub fn field(&self) -> CsrfField {
        CsrfField {
            name: CSRF_FIELD_NAME,
            value: self.value.clone(),
        }
    }

    /// A token issued during this request never verifies: the client had no
    /// cookie to echo.
    pub fn verify(&self, submitted: &str) -> bool {
        if self.issued {
            return false;
        }
        Sha256::digest(self.value.as_bytes()) == Sha256::digest(submitted.trim().as_bytes())
    }

    pub fn set_cookie(&self, secure: bool) -> Option<HeaderValue> {
        if !self.issued {
            return None;
        }
        HeaderValue::from_str(&session_cookie(CSRF_COOKIE, &self.value, secure)).ok()
    }
}

fn is_well_formed_token(raw: &str) -> bool {
    URL_SAFE_NO_PAD
        .decode(raw)
        .map(|bytes| bytes.len() == CSRF_TOKEN_BYTES)
        .unwrap_or(false)
}

/// Value of the named cookie from the request's `Cookie` headers.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

pub fn session_cookie(name: &str, value: &str, secure: bool) -> String {
    format!(
        "{name}={value}; Path=/; HttpOnly; SameSite=Lax{}",
        secure_suffix(secure)
    )
}

pub fn expired_cookie(name: &str, secure: bool) -> String {
    format!(
        "{name}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax{}",
        secure_suffix(secure)
    )
}

fn secure_suffix(secure: bool) -> &'static str {
    if secure { "; Secure" } else { "" }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_cookie(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    fn cookie_pair(set_cookie: &HeaderValue) -> String {
        set_cookie
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_owned()
    }

    #[test]
    fn cookie_value_finds_named_cookie() {
        let headers = headers_with_cookie("a=1; realm=42 ; flash=");
        assert_eq!(cookie_value(&headers, "realm"), Some("42"));
        assert_eq!(cookie_value(&headers, "a"), Some("1"));
        assert_eq!(cookie_value(&headers, "flash"), None);
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn persisted_flash_survives_exactly_one_request() {
        let mut first = Flash::default();
        first.error("Unauthorized.");
        first.error_now("only for this render");
        assert_eq!(first.current().len(), 1);
        let set_cookie = first.set_cookie(false).unwrap();

        let mut second = Flash::from_headers(&headers_with_cookie(&cookie_pair(&set_cookie)));
        assert_eq!(
            second.current_errors().collect::<Vec<_>>(),
            ["Unauthorized."]
        );
        assert_eq!(second.render().len(), 1);
        let cleared = second.set_cookie(false).unwrap();
        assert!(cleared.to_str().unwrap().contains("Max-Age=0"));

        let third = Flash::from_headers(&HeaderMap::new());
        assert!(third.current().is_empty());
        assert!(third.set_cookie(false).is_none());
    }

    #[test]
    fn unrendered_flash_is_kept_across_a_redirect() {
        let mut first = Flash::default();
        first.error("Realm not found.");
        let set_cookie = first.set_cookie(false).unwrap();

        let mut redirected = Flash::from_headers(&headers_with_cookie(&cookie_pair(&set_cookie)));
        redirected.error("Select a realm to continue.");
        redirected.error_now("dropped with the redirect");
        let set_cookie = redirected.set_cookie(false).unwrap();

        let mut shown = Flash::from_headers(&headers_with_cookie(&cookie_pair(&set_cookie)));
        assert_eq!(
            shown.current_errors().collect::<Vec<_>>(),
            ["Realm not found.", "Select a realm to continue."]
        );
        shown.render();
        let cleared = shown.set_cookie(false).unwrap();
        assert!(cleared.to_str().unwrap().contains("Max-Age=0"));
    }

    #[test]
    fn incoming_flash_without_render_is_written_back() {
        let mut first = Flash::default();
        first.alert("Saved.");
        let set_cookie = first.set_cookie(false).unwrap();

        let untouched = Flash::from_headers(&headers_with_cookie(&cookie_pair(&set_cookie)));
        assert_eq!(
            untouched.set_cookie(false).map(|value| cookie_pair(&value)),
            Some(cookie_pair(&set_cookie))
        );
    }

    #[test]
    fn malformed_flash_cookie_is_dropped() {
        let flash = Flash::from_headers(&headers_with_cookie("flash=%%%not-base64"));
        assert!(flash.current().is_empty());
        assert!(flash.set_cookie(true).unwrap().to_str().unwrap().ends_with("; Secure"));
    }

    #[test]
    fn flash_levels_are_kept() {
        let mut flash = Flash::default();
        flash.warning_now("careful");
        flash.alert_now("saved");
        flash.warning("later");
        flash.alert("later too");
        let levels: Vec<_> = flash.current().iter().map(|m| m.level).collect();
        assert_eq!(levels, [FlashLevel::Warning, FlashLevel::Alert]);
        assert_eq!(flash.pending().len(), 2);
        assert_eq!(flash.current_errors().count(), 0);
    }

    #[test]
    fn csrf_token_verifies_against_its_cookie() {
        let issued = CsrfToken::from_headers(&HeaderMap::new());
        let field = issued.field();
        assert_eq!(field.name, CSRF_FIELD_NAME);
        assert!(!issued.verify(&field.value));

        let set_cookie = issued.set_cookie(false).unwrap();
        let returning = CsrfToken::from_headers(&headers_with_cookie(&cookie_pair(&set_cookie)));
        assert!(returning.set_cookie(false).is_none());
        assert_eq!(returning.field(), field);
        assert!(returning.verify(&field.value));
        assert!(!returning.verify("forged"));
    }

    #[test]
    fn malformed_csrf_cookie_is_replaced() {
        let token = CsrfToken::from_headers(&headers_with_cookie("csrf_token=short"));
        assert!(token.set_cookie(false).is_some());
        assert_ne!(token.field().value, "short");
    }

    #[test]
    fn hidden_input_escapes_value() {
        let field = CsrfField {
            name: CSRF_FIELD_NAME,
            value: "a\"b".to_owned(),
        };
        assert_eq!(
            field.hidden_input(),
            "<input type=\"hidden\" name=\"csrf_token\" value=\"a&quot;b\" />"
        );
    }
}
