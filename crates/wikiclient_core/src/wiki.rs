//! Page-oriented operations built on an [`XmlRpcTransport`], with the fallbacks the
//! legacy server needs.
//!
//! Only `logout`, `get_page_html`, `search` and `get_recent_changes` recover from
//! remote failures; every other operation hands the error back unchanged.

use std::collections::{BTreeSet, HashSet};

use futures::future::join_all;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::access::AccessPolicy;
use crate::cache::ContentCache;
use crate::codec::RpcValue;
use crate::config::{ClientConfig, MAX_SUMMARY_CHARS, MethodTable, SearchSection};
use crate::error::{Result, WikiError};
use crate::pages::{
    ChangeRecord, MatchType, PageContent, PageInfo, PageRecord, PageTreeNode, SearchHit,
    build_page_tree, collect_namespaces, in_namespace,
};
use crate::session::SessionStore;
use crate::transport::XmlRpcTransport;

const ALL_NAMESPACES: &str = ".";

/// One full page listing shared by the strategies of a single search.
type PageListing = OnceCell<Result<Vec<PageRecord>>>;

pub struct WikiService<T> {
    transport: T,
    methods: MethodTable,
    search: SearchSection,
    policy: AccessPolicy,
    cache: ContentCache,
}

impl<T: XmlRpcTransport> WikiService<T> {
    pub fn new(transport: T, config: &ClientConfig) -> Self {
        Self {
            transport,
            methods: config.methods.clone(),
            search: config.search.clone(),
            policy: AccessPolicy::from_config(&config.access),
            cache: ContentCache::new(config.search.cache_ttl()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn session(&self) -> &SessionStore {
        self.transport.session()
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Log in and record the session. Any failure leaves no session state behind.
    pub async fn login(&self, username: &str, password: &str) -> bool {
        if let Err(error) = self.session().clear_cookie() {
            warn!(%error, "failed to clear session cookie before login");
        }

        let outcome = self
            .transport
            .call(
                &self.methods.login,
                &[RpcValue::from(username), RpcValue::from(password)],
            )
            .await;
        let accepted = match outcome {
            Ok(Some(value)) => value.as_bool() == Some(true),
            Ok(None) => false,
            Err(error) => {
                warn!(%error, username, "login call failed");
                false
            }
        };

        if accepted {
            match self.session().mark_authenticated(username) {
                Ok(()) => {
                    info!(username, "logged in");
                    return true;
                }
                Err(error) => warn!(%error, "failed to persist login state"),
            }
        } else {
            warn!(username, "login rejected");
        }
        self.clear_local_session();
        false
    }

    /// Best-effort remote logoff; local session state is always cleared.
    pub async fn logout(&self) {
        match self.transport.call(&self.methods.logoff, &[]).await {
            Ok(_) => debug!("remote logoff succeeded"),
            Err(error) => warn!(%error, "remote logoff failed; clearing local session anyway"),
        }
        self.clear_local_session();
    }

    fn clear_local_session(&self) {
        if let Err(error) = self.session().clear() {
            warn!(%error, "failed to clear session state");
        }
    }

    pub fn is_authenticated(&self) -> Result<bool> {
        self.session().is_authenticated()
    }

    /// Username of the stored session, if it is authenticated.
    pub fn current_user(&self) -> Result<Option<String>> {
        if !self.session().is_authenticated()? {
            return Ok(None);
        }
        self.session().username()
    }

    /// Raw wiki markup of a page.
    pub async fn get_page(&self, id: &str) -> Result<String> {
        let value = self
            .transport
            .call(&self.methods.get_page, &[RpcValue::from(id)])
            .await?;
        Ok(value.map(|value| value.to_text()).unwrap_or_default())
    }

    /// Rendered HTML. Falls back to escaped raw markup, then to an error placeholder,
    /// so a page is always viewable.
    pub async fn get_page_html(&self, id: &str) -> String {
        let error = match self
            .transport
            .call(&self.methods.get_page_html, &[RpcValue::from(id)])
            .await
        {
            Ok(value) => return value.map(|value| value.to_text()).unwrap_or_default(),
            Err(error) => error,
        };
        warn!(%error, page = id, "HTML fetch failed; falling back to raw markup");

        match self.get_page(id).await {
            Ok(raw) => format!(
                "<p><i>(HTML rendering unavailable, showing page source)</i></p><pre>{}</pre>",
                escape_html(&raw)
            ),
            Err(error) => {
                warn!(%error, page = id, "raw markup fallback failed");
                format!(
                    "<p><b>Error: unable to load page '{}'.</b></p>",
                    escape_html(id)
                )
            }
        }
    }

    pub async fn get_page_info(&self, id: &str) -> Result<PageInfo> {
        let value = self
            .transport
            .call(&self.methods.get_page_info, &[RpcValue::from(id)])
            .await?;
        match value {
            Some(info @ RpcValue::Struct(_)) => Ok(PageInfo::from_rpc(id, &info)),
            Some(other) => Err(WikiError::malformed(format!(
                "{} returned {} instead of struct",
                self.methods.get_page_info,
                other.kind()
            ))),
            None => Err(WikiError::malformed(format!(
                "{} returned no value",
                self.methods.get_page_info
            ))),
        }
    }

    /// Raw markup, HTML and modification stamp fetched concurrently.
    pub async fn get_page_content(&self, id: &str) -> Result<PageContent> {
        let (content, html, info) = futures::join!(
            self.get_page(id),
            self.get_page_html(id),
            self.get_page_info(id)
        );
        let last_modified = match info {
            Ok(info) => info.last_modified,
            Err(error) => {
                debug!(%error, page = id, "page info unavailable");
                String::new()
            }
        };
        Ok(PageContent {
            content: content?,
            html,
            last_modified,
        })
    }

    /// Save a page. The summary is checked before anything is sent.
    pub async fn put_page(&self, id: &str, content: &str, summary: &str) -> Result<bool> {
        let summary_chars = summary.chars().count();
        if summary_chars > MAX_SUMMARY_CHARS {
            return Err(WikiError::validation(format!(
                "summary must not exceed {MAX_SUMMARY_CHARS} characters (got {summary_chars})"
            )));
        }

        let attributes = RpcValue::from_members([
            ("sum", RpcValue::from(summary)),
            ("minor", RpcValue::from(false)),
        ]);
        let value = self
            .transport
            .call(
                &self.methods.put_page,
                &[RpcValue::from(id), RpcValue::from(content), attributes],
            )
            .await?;
        let saved = match value {
            None => true,
            Some(value) => value.as_bool() == Some(true),
        };
        if saved {
            self.cache.invalidate(id)?;
            info!(page = id, "page saved");
        }
        Ok(saved)
    }

    /// All pages, filtered client-side to `namespace` (`.` or empty for everything).
    pub async fn list_pages(&self, namespace: &str) -> Result<Vec<PageRecord>> {
        let value = self.transport.call(&self.methods.all_pages, &[]).await?;
        let items = match value {
            None => return Ok(Vec::new()),
            Some(RpcValue::Array(items)) => items,
            Some(other) => {
                return Err(WikiError::malformed(format!(
                    "{} returned {} instead of array",
                    self.methods.all_pages,
                    other.kind()
                )));
            }
        };

        let mut skipped = 0usize;
        let mut pages = Vec::with_capacity(items.len());
        for item in &items {
            match PageRecord::from_rpc(item) {
                Some(page) if in_namespace(&page.id, namespace) => pages.push(page),
                Some(_) => {}
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(skipped, "ignored page entries without an id");
        }
        Ok(pages)
    }

    pub async fn list_namespaces(&self) -> Result<BTreeSet<String>> {
        let pages = self.list_pages(ALL_NAMESPACES).await?;
        Ok(collect_namespaces(&pages))
    }

    pub async fn page_tree(&self, namespace: &str) -> Result<PageTreeNode> {
        let pages = self.list_pages(namespace).await?;
        Ok(build_page_tree(&pages))
    }

    /// Namespaces the logged-in user may browse; empty when nobody is logged in.
    pub async fn browsable_namespaces(&self) -> Result<Vec<String>> {
        let Some(username) = self.current_user()? else {
            return Ok(Vec::new());
        };
        let candidates: Vec<String> = self.list_namespaces().await?.into_iter().collect();
        Ok(self.policy.allowed(&username, &candidates))
    }

    /// Remote full-text search merged with a content scan of recently modified pages.
    pub async fn search(&self, query: &str) -> Vec<SearchHit> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }

        let listing = PageListing::new();
        let (titles, contents) = futures::join!(
            self.remote_search(query, &listing),
            self.content_search(query, &listing)
        );
        debug!(
            title_hits = titles.len(),
            content_hits = contents.len(),
            "search finished"
        );
        merge_hits(titles, contents)
    }

    async fn all_pages<'a>(&self, listing: &'a PageListing) -> &'a Result<Vec<PageRecord>> {
        listing
            .get_or_init(|| self.list_pages(ALL_NAMESPACES))
            .await
    }

    async fn remote_search(&self, query: &str, listing: &PageListing) -> Vec<SearchHit> {
        match self
            .transport
            .call(&self.methods.search, &[RpcValue::from(query)])
            .await
        {
            Ok(Some(RpcValue::Array(items))) => {
                return items.iter().filter_map(SearchHit::from_rpc).collect();
            }
            Ok(other) => warn!(
                kind = other.as_ref().map(RpcValue::kind).unwrap_or("none"),
                "remote search returned a non-sequence; filtering titles locally"
            ),
            Err(error) => warn!(%error, "remote search failed; filtering titles locally"),
        }

        let needle = query.to_lowercase();
        match self.all_pages(listing).await {
            Ok(pages) => pages
                .iter()
                .filter(|page| {
                    page.id.to_lowercase().contains(&needle)
                        || page.title.to_lowercase().contains(&needle)
                })
                .map(|page| SearchHit {
                    id: page.id.clone(),
                    title: page.title.clone(),
                    score: None,
                    snippet: None,
                    match_type: MatchType::Title,
                })
                .collect(),
            Err(error) => {
                warn!(%error, "title filter fallback failed");
                Vec::new()
            }
        }
    }

    async fn content_search(&self, query: &str, listing: &PageListing) -> Vec<SearchHit> {
        let mut pages = match self.all_pages(listing).await {
            Ok(pages) => pages.clone(),
            Err(error) => {
                warn!(%error, "content scan could not list pages");
                return Vec::new();
            }
        };
        pages.sort_by_key(|page| std::cmp::Reverse(page.modified_key()));
        pages.truncate(self.search.content_scan_limit);

        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        for batch in pages.chunks(self.search.batch_size.max(1)) {
            let bodies = join_all(batch.iter().map(|page| async move {
                let body = self
                    .cache
                    .get_with_cache(&page.id, || self.get_page(&page.id))
                    .await;
                (page, body)
            }))
            .await;

            for (page, body) in bodies {
                let body = match body {
                    Ok(body) => body,
                    Err(error) => {
                        debug!(%error, page = %page.id, "skipping page in content scan");
                        continue;
                    }
                };
                if let Some(snippet) = snippet_around(&body, &needle, self.search.snippet_radius)
                {
                    hits.push(SearchHit {
                        id: page.id.clone(),
                        title: page.title.clone(),
                        score: None,
                        snippet: Some(snippet),
                        match_type: MatchType::Content,
                    });
                }
            }
        }
        hits
    }

    /// Recent changes since `since` (unix seconds). Falls back to the most recently
    /// modified pages when the server refuses or returns a non-sequence.
    pub async fn get_recent_changes(&self, since: i64) -> Result<Vec<ChangeRecord>> {
        match self
            .transport
            .call(&self.methods.recent_changes, &[RpcValue::from(since)])
            .await
        {
            Ok(Some(RpcValue::Array(items))) => {
                return Ok(items.iter().filter_map(ChangeRecord::from_rpc).collect());
            }
            Ok(other) => warn!(
                kind = other.as_ref().map(RpcValue::kind).unwrap_or("none"),
                "recent changes returned a non-sequence; deriving from page list"
            ),
            Err(error) => warn!(%error, "recent changes failed; deriving from page list"),
        }

        let mut pages: Vec<PageRecord> = self
            .list_pages(ALL_NAMESPACES)
            .await?
            .into_iter()
            .filter(|page| !page.last_modified.trim().is_empty())
            .collect();
        pages.sort_by_key(|page| std::cmp::Reverse(page.modified_key()));
        pages.truncate(self.search.recent_changes_limit);
        Ok(pages.iter().map(ChangeRecord::from_page).collect())
    }
}

/// Title hits first, then content hits, one entry per page id.
fn merge_hits(titles: Vec<SearchHit>, contents: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    titles
        .into_iter()
        .chain(contents)
        .filter(|hit| seen.insert(hit.id.clone()))
        .collect()
}

/// Case-insensitive match of `needle` (already lowercase) in `body`, returned with
/// `radius` characters of context on each side and whitespace collapsed. Matching
/// runs over per-character lowercase expansions so positions stay in `body` chars.
fn snippet_around(body: &str, needle: &str, radius: usize) -> Option<String> {
    let needle: Vec<char> = needle.chars().collect();
    if needle.is_empty() {
        return None;
    }

    let chars: Vec<char> = body.chars().collect();
    let mut folded = Vec::with_capacity(chars.len());
    let mut origin = Vec::with_capacity(chars.len());
    for (index, ch) in chars.iter().enumerate() {
        for lower in ch.to_lowercase() {
            folded.push(lower);
            origin.push(index);
        }
    }

    let hit = folded
        .windows(needle.len())
        .position(|window| window == needle.as_slice())?;
    let start = origin[hit];
    let end = origin[hit + needle.len() - 1] + 1;

    let from = start.saturating_sub(radius);
    let to = (end + radius).min(chars.len());
    let window: String = chars[from..to].iter().collect();
    Some(window.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#039;")
}
