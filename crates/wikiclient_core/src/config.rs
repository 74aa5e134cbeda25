use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_USER_AGENT: &str = "wikiclient/0.1";
pub const DEFAULT_XMLRPC_PATH: &str = "/lib/exe/xmlrpc.php";
pub const DEFAULT_SESSION_COOKIE: &str = "DokuWiki";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MAX_SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ClientConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub methods: MethodTable,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub access: AccessSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub session_cookie: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Remote method names. These must match the server's XML-RPC method table verbatim.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MethodTable {
    pub login: String,
    pub logoff: String,
    pub get_page: String,
    pub get_page_html: String,
    pub get_page_info: String,
    pub put_page: String,
    pub search: String,
    pub all_pages: String,
    pub recent_changes: String,
}

impl Default for MethodTable {
    fn default() -> Self {
        Self {
            login: "dokuwiki.login".to_string(),
            logoff: "dokuwiki.logoff".to_string(),
            get_page: "wiki.getPage".to_string(),
            get_page_html: "wiki.getPageHTML".to_string(),
            get_page_info: "wiki.getPageInfo".to_string(),
            put_page: "wiki.putPage".to_string(),
            search: "dokuwiki.search".to_string(),
            all_pages: "wiki.getAllPages".to_string(),
            recent_changes: "wiki.getRecentChanges".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchSection {
    /// Most recently modified pages scanned by the content fallback.
    pub content_scan_limit: usize,
    /// Concurrent page fetches per content-scan batch.
    pub batch_size: usize,
    /// Characters kept on each side of the first match in a snippet.
    pub snippet_radius: usize,
    pub recent_changes_limit: usize,
    pub cache_ttl_secs: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            content_scan_limit: 50,
            batch_size: 5,
            snippet_radius: 20,
            recent_changes_limit: 20,
            cache_ttl_secs: 300,
        }
    }
}

impl SearchSection {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccessSection {
    /// Namespaces a `guest` principal may browse besides `user:guest`.
    pub public_namespaces: Vec<String>,
}

impl Default for AccessSection {
    fn default() -> Self {
        Self {
            public_namespaces: vec!["playground".to_string(), "solutions".to_string()],
        }
    }
}

impl ClientConfig {
    /// Resolve the XML-RPC endpoint: env WIKI_XMLRPC_URL > config url > None.
    pub fn endpoint_url(&self) -> Option<String> {
        self.endpoint_url_with_lookup(|key| env::var(key).ok())
    }

    fn endpoint_url_with_lookup<F>(&self, lookup_env: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup_nonempty(&lookup_env, "WIKI_XMLRPC_URL")
            .or_else(|| self.wiki.url.clone())
            .and_then(|url| derive_endpoint_url(&url))
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        lookup_nonempty(&|key: &str| env::var(key).ok(), "WIKI_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Resolve request timeout: env WIKI_HTTP_TIMEOUT_MS > config > DEFAULT_TIMEOUT_MS.
    pub fn timeout(&self) -> Duration {
        self.timeout_with_lookup(|key| env::var(key).ok())
    }

    fn timeout_with_lookup<F>(&self, lookup_env: F) -> Duration
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = lookup_nonempty(&lookup_env, "WIKI_HTTP_TIMEOUT_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .or(self.wiki.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        Duration::from_millis(millis)
    }

    pub fn session_cookie(&self) -> &str {
        self.wiki
            .session_cookie
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_SESSION_COOKIE)
    }
}

pub(crate) fn lookup_nonempty<F>(lookup_env: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup_env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Load and parse a ClientConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ClientConfig> {
    if !config_path.exists() {
        return Ok(ClientConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ClientConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    if parsed.search.batch_size == 0 {
        bail!(
            "[search] batch_size must be at least 1 in {}",
            config_path.display()
        );
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Default)]
pub struct WikiConfigPatch {
    pub set_url: Option<String>,
    pub set_session_cookie: Option<String>,
}

/// Update selected keys under `[wiki]` while preserving all other config sections.
/// Returns `true` when a write occurred.
pub fn patch_wiki_config(config_path: &Path, patch: &WikiConfigPatch) -> Result<bool> {
    if patch.set_url.is_none() && patch.set_session_cookie.is_none() {
        return Ok(false);
    }

    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!(
            "top-level TOML must be a table in {}",
            config_path.display()
        )
    })?;
    let wiki_entry = root_table
        .entry("wiki".to_string())
        .or_insert_with(|| Value::Table(Default::default()));
    let wiki_table = wiki_entry
        .as_table_mut()
        .ok_or_else(|| anyhow::anyhow!("[wiki] must be a table in {}", config_path.display()))?;

    if let Some(url) = &patch.set_url {
        if derive_endpoint_url(url).is_none() {
            bail!("wiki url cannot be empty");
        }
        wiki_table.insert("url".to_string(), Value::String(url.trim().to_string()));
    }
    if let Some(cookie) = &patch.set_session_cookie {
        if cookie.trim().is_empty() {
            wiki_table.remove("session_cookie");
        } else {
            wiki_table.insert(
                "session_cookie".to_string(),
                Value::String(cookie.trim().to_string()),
            );
        }
    }

    if root == original {
        return Ok(false);
    }

    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let rendered = toml::to_string_pretty(&root).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

/// Turn a wiki base URL into its XML-RPC endpoint. URLs already pointing at a `.php`
/// script are kept as-is.
pub fn derive_endpoint_url(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.ends_with(".php") {
        return Some(trimmed.to_string());
    }
    Some(format!("{trimmed}{DEFAULT_XMLRPC_PATH}"))
}
