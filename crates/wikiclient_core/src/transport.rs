use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, COOKIE, SET_COOKIE, USER_AGENT};
use tracing::{debug, warn};

use crate::codec::{MethodResponse, RpcValue, decode_response, encode_call, has_xml_declaration};
use crate::config::ClientConfig;
use crate::error::{Result, WikiError};
use crate::session::SessionStore;

pub const XML_MEDIA_TYPE: &str = "text/xml";
const MAX_ERROR_BODY_CHARS: usize = 500;

/// One XML-RPC round-trip per call, with session continuity.
#[async_trait]
pub trait XmlRpcTransport: Send + Sync {
    /// `Ok(None)` is a vacuous success (empty `<params>`).
    async fn call(&self, method: &str, params: &[RpcValue]) -> Result<Option<RpcValue>>;
    fn session(&self) -> &SessionStore;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub endpoint: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub session_cookie: String,
}

impl TransportConfig {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let endpoint = config.endpoint_url().ok_or_else(|| {
            WikiError::validation("no wiki url configured (set [wiki] url or WIKI_XMLRPC_URL)")
        })?;
        Ok(Self {
            endpoint,
            user_agent: config.user_agent(),
            timeout: config.timeout(),
            session_cookie: config.session_cookie().to_string(),
        })
    }
}

pub struct XmlRpcClient {
    http: Client,
    config: TransportConfig,
    session: SessionStore,
    request_count: AtomicUsize,
}

impl XmlRpcClient {
    pub fn new(config: TransportConfig, session: SessionStore) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|error| WikiError::Transport {
                method: "<client>".to_string(),
                status: None,
                message: format!("failed to build HTTP client: {error}"),
            })?;
        Ok(Self {
            http,
            config,
            session,
            request_count: AtomicUsize::new(0),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Requests sent so far, including failed ones.
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl XmlRpcTransport for XmlRpcClient {
    async fn call(&self, method: &str, params: &[RpcValue]) -> Result<Option<RpcValue>> {
        let body = encode_call(method, params)?;
        let cookie = self.session.cookie()?;

        let mut request = self
            .http
            .post(&self.config.endpoint)
            .header(CONTENT_TYPE, XML_MEDIA_TYPE)
            .header(ACCEPT, XML_MEDIA_TYPE)
            .header(USER_AGENT, self.config.user_agent.as_str())
            .body(body);
        if let Some(cookie) = &cookie {
            request = request.header(COOKIE, cookie.as_str());
        }

        self.request_count.fetch_add(1, Ordering::Relaxed);
        debug!(method, with_cookie = cookie.is_some(), "sending XML-RPC request");
        let response = request
            .send()
            .await
            .map_err(|error| request_error(method, &error, self.config.timeout))?;

        let status = response.status();
        let set_cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();
        if let Some(session_cookie) =
            extract_session_cookie(&set_cookies, &self.config.session_cookie)
            && self.session.replace_cookie(&session_cookie)?
        {
            debug!(method, "stored updated session cookie");
        }

        let text = response
            .text()
            .await
            .map_err(|error| request_error(method, &error, self.config.timeout))?;
        debug!(method, status = status.as_u16(), bytes = text.len(), "received XML-RPC response");
        interpret_response(method, status.as_u16(), &text)
    }

    fn session(&self) -> &SessionStore {
        &self.session
    }
}

fn request_error(method: &str, error: &reqwest::Error, timeout: Duration) -> WikiError {
    let message = if error.is_timeout() {
        format!("request timed out after {} ms", timeout.as_millis())
    } else {
        error.to_string()
    };
    WikiError::Transport {
        method: method.to_string(),
        status: error.status().map(|status| status.as_u16()),
        message,
    }
}

/// Classify a raw HTTP response into a payload or a typed failure.
pub fn interpret_response(method: &str, status: u16, body: &str) -> Result<Option<RpcValue>> {
    if !(200..300).contains(&status) {
        return Err(WikiError::Transport {
            method: method.to_string(),
            status: Some(status),
            message: format!("HTTP {status}: {}", truncate_chars(body, MAX_ERROR_BODY_CHARS)),
        });
    }

    if !has_xml_declaration(body) {
        if looks_like_login_page(body) {
            warn!(method, "server answered with a login page");
            return Err(WikiError::SessionExpired {
                method: method.to_string(),
            });
        }
        return Err(WikiError::malformed(format!(
            "non-XML response to {method}: {}",
            truncate_chars(body, MAX_ERROR_BODY_CHARS)
        )));
    }

    match decode_response(body)? {
        MethodResponse::Success(value) => Ok(value),
        MethodResponse::Fault { code, message } => {
            warn!(method, code, %message, "XML-RPC fault");
            Err(WikiError::Fault { code, message })
        }
    }
}

fn looks_like_login_page(body: &str) -> bool {
    let lowered = body.to_lowercase();
    lowered.contains("<form") && lowered.contains("login")
}

/// Find `<name>=<value>` among `Set-Cookie` header values.
pub fn extract_session_cookie(set_cookies: &[String], name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    set_cookies.iter().find_map(|header| {
        let pair = header.split(';').next()?.trim();
        let value = pair.strip_prefix(&prefix)?;
        if value.is_empty() {
            None
        } else {
            Some(pair.to_string())
        }
    })
}

fn truncate_chars(text: &str, limit: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
