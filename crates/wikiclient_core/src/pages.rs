use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::codec::RpcValue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    pub id: String,
    pub title: String,
    pub namespace: String,
    pub last_modified: String,
    pub size: i64,
}

impl PageRecord {
    pub fn new(id: &str, last_modified: &str, size: i64) -> Self {
        let (namespace, title) = split_page_id(id);
        Self {
            id: id.to_string(),
            title: title.to_string(),
            namespace: namespace.to_string(),
            last_modified: last_modified.to_string(),
            size,
        }
    }

    /// Shape a raw page struct. Returns `None` when the struct has no usable id.
    pub fn from_rpc(value: &RpcValue) -> Option<Self> {
        let id = value.text_field(&["id", "name"])?;
        if id.trim().is_empty() {
            return None;
        }
        let last_modified = value
            .text_field(&["mtime", "lastModified", "rev"])
            .unwrap_or_default();
        let size = value.get("size").and_then(RpcValue::as_i64).unwrap_or(0);
        Some(Self::new(&id, &last_modified, size))
    }

    /// Numeric view of `last_modified` for ordering; non-numeric stamps sort last.
    pub fn modified_key(&self) -> i64 {
        self.last_modified.trim().parse().unwrap_or(i64::MIN)
    }
}

/// Split `a:b:c` into (`a:b`, `c`).
pub fn split_page_id(id: &str) -> (&str, &str) {
    match id.rsplit_once(':') {
        Some((namespace, title)) => (namespace, title),
        None => ("", id),
    }
}

/// `.` and the empty string mean "no filter".
pub fn in_namespace(page_id: &str, namespace: &str) -> bool {
    let namespace = namespace.trim();
    if namespace.is_empty() || namespace == "." {
        return true;
    }
    page_id
        .strip_prefix(namespace)
        .is_some_and(|rest| rest.starts_with(':'))
}

pub fn collect_namespaces(pages: &[PageRecord]) -> BTreeSet<String> {
    pages
        .iter()
        .filter(|page| !page.namespace.is_empty())
        .map(|page| page.namespace.clone())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTreeNode {
    pub children: BTreeMap<String, PageTreeNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub is_page: bool,
}

/// Fold pages into a namespace tree. A node can end up both a page and a parent
/// when one page id is a namespace prefix of another; both facts are kept.
pub fn build_page_tree(pages: &[PageRecord]) -> PageTreeNode {
    let mut root = PageTreeNode::default();
    for page in pages {
        let segments: Vec<&str> = page.id.split(':').collect();
        let last = segments.len() - 1;
        let mut node = &mut root;
        for (index, segment) in segments.into_iter().enumerate() {
            node = node.children.entry(segment.to_string()).or_default();
            if index == last {
                node.id = Some(page.id.clone());
                node.title = Some(if page.title.is_empty() {
                    segment.to_string()
                } else {
                    page.title.clone()
                });
                node.is_page = true;
            }
        }
    }
    root
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub id: String,
    pub user: String,
    #[serde(rename = "type")]
    pub change_type: String,
    pub timestamp: i64,
    pub summary: String,
}

impl ChangeRecord {
    pub fn from_rpc(value: &RpcValue) -> Option<Self> {
        let id = value.text_field(&["id", "name"])?;
        Some(Self {
            id,
            user: value.text_field(&["user", "author"]).unwrap_or_default(),
            change_type: value.text_field(&["type"]).unwrap_or_default(),
            timestamp: ["timestamp", "lastModified", "version"]
                .iter()
                .find_map(|name| value.get(name).and_then(RpcValue::as_i64))
                .unwrap_or(0),
            summary: value.text_field(&["summary", "sum"]).unwrap_or_default(),
        })
    }

    /// Pseudo change derived from a page listing.
    pub fn from_page(page: &PageRecord) -> Self {
        Self {
            id: page.id.clone(),
            user: String::new(),
            change_type: String::new(),
            timestamp: page.last_modified.trim().parse().unwrap_or(0),
            summary: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub name: String,
    pub last_modified: String,
    pub author: String,
    pub version: Option<i64>,
}

impl PageInfo {
    pub fn from_rpc(id: &str, value: &RpcValue) -> Self {
        Self {
            name: value.text_field(&["name", "id"]).unwrap_or_else(|| id.to_string()),
            last_modified: value.text_field(&["lastModified", "mtime"]).unwrap_or_default(),
            author: value.text_field(&["author", "user"]).unwrap_or_default(),
            version: value.get("version").and_then(RpcValue::as_i64),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContent {
    pub content: String,
    pub html: String,
    pub last_modified: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Title,
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    pub match_type: MatchType,
}

impl SearchHit {
    pub fn from_rpc(value: &RpcValue) -> Option<Self> {
        let id = value.text_field(&["id"])?;
        let title = value
            .text_field(&["title"])
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| id.clone());
        Some(Self {
            title,
            score: value.get("score").and_then(RpcValue::as_i64),
            snippet: value.text_field(&["snippet"]).filter(|text| !text.is_empty()),
            match_type: MatchType::Title,
            id,
        })
    }
}
