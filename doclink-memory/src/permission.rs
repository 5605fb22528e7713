use async_trait::async_trait;
use std::collections::HashMap;

use doclink_core::{
    error::{AccessError, AccessResult},
    token::{PermissionMode, PermissionResolver},
};

/// A permission resolver backed by a fixed table of tokens.
///
/// A token granted on a resource covers everything below it, and a token granted for
/// [`PermissionMode::All`] also satisfies reads.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    tokens: HashMap<(String, PermissionMode), String>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `token` for `mode` on `resource_link`.
    pub fn grant(
        mut self,
        resource_link: impl Into<String>,
        mode: PermissionMode,
        token: impl Into<String>,
    ) -> Self {
        let link = resource_link.into().trim_matches('/').to_string();
        self.tokens.insert((link, mode), token.into());
        self
    }
}

#[async_trait]
impl PermissionResolver for StaticPermissions {
    async fn permission(&self, resource_link: &str, mode: PermissionMode) -> AccessResult<String> {
        let link = resource_link.trim_matches('/').to_string();

        self.lookup(&link, mode).cloned().ok_or_else(|| {
            AccessError::PermissionDenied(format!("no {mode:?} permission for {link}"))
        })
    }
}

impl StaticPermissions {
    /// The closest grant on `link` or one of its ancestors.
    fn lookup(&self, link: &str, mode: PermissionMode) -> Option<&String> {
        let mut candidate = link;

        loop {
            let token = match mode {
                PermissionMode::All => self.granted(candidate, PermissionMode::All),
                PermissionMode::Read => self
                    .granted(candidate, PermissionMode::Read)
                    .or_else(|| self.granted(candidate, PermissionMode::All)),
            };
            if token.is_some() {
                return token;
            }

            candidate = &candidate[..candidate.rfind('/')?];
        }
    }

    fn granted(&self, link: &str, mode: PermissionMode) -> Option<&String> {
        self.tokens.get(&(link.to_string(), mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_covers_read() {
        let permissions = StaticPermissions::new()
            .grant("dbs/D1/colls/C1", PermissionMode::All, "full")
            .grant("dbs/D1/colls/C2", PermissionMode::Read, "read-only");

        assert_eq!(
            permissions.permission("dbs/D1/colls/C1", PermissionMode::Read).await.unwrap(),
            "full"
        );
        assert_eq!(
            permissions.permission("/dbs/D1/colls/C2/", PermissionMode::Read).await.unwrap(),
            "read-only"
        );
        assert!(matches!(
            permissions.permission("dbs/D1/colls/C2", PermissionMode::All).await,
            Err(AccessError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_grant_covers_descendants() {
        let permissions =
            StaticPermissions::new().grant("dbs/D1/colls/C1", PermissionMode::All, "full");

        assert_eq!(
            permissions.permission("dbs/D1/colls/C1/docs/a", PermissionMode::All).await.unwrap(),
            "full"
        );
        assert!(permissions.permission("dbs/D1/colls/C10", PermissionMode::Read).await.is_err());
        assert!(permissions.permission("dbs/D1", PermissionMode::Read).await.is_err());
    }
}
