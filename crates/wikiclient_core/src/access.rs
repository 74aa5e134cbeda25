//! Which namespaces a principal may browse or create pages in.

use crate::config::AccessSection;

pub const ADMIN_PRINCIPAL: &str = "admin";
pub const GUEST_PRINCIPAL: &str = "guest";
const MEMBER_SHARED_NAMESPACES: [&str; 2] = ["shared", "projects"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    public_namespaces: Vec<String>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self::from_config(&AccessSection::default())
    }
}

impl AccessPolicy {
    pub fn from_config(section: &AccessSection) -> Self {
        Self {
            public_namespaces: section.public_namespaces.clone(),
        }
    }

    /// Filter `candidates` down to what `principal` may see, keeping input order.
    pub fn allowed(&self, principal: &str, candidates: &[String]) -> Vec<String> {
        if principal.is_empty() {
            return Vec::new();
        }
        if principal == ADMIN_PRINCIPAL {
            return candidates.to_vec();
        }

        let home = format!("user:{principal}");
        candidates
            .iter()
            .filter(|namespace| {
                if principal == GUEST_PRINCIPAL {
                    self.public_namespaces.iter().any(|public| public == *namespace)
                        || within(namespace, &home)
                } else {
                    within(namespace, &home)
                        || MEMBER_SHARED_NAMESPACES
                            .iter()
                            .any(|shared| within(namespace, shared))
                }
            })
            .cloned()
            .collect()
    }
}

/// `namespace` is `root` itself or nested below it.
fn within(namespace: &str, root: &str) -> bool {
    namespace == root
        || namespace
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with(':'))
}

/// [`AccessPolicy::allowed`] with the default public namespaces.
pub fn allowed_namespaces(principal: &str, candidates: &[String]) -> Vec<String> {
    AccessPolicy::default().allowed(principal, candidates)
}
