//! Authorization token minting.
//!
//! Every request carries exactly one authorization token, minted per request by the
//! [`TokenAuthority`] in one of two modes:
//!
//! - **Owner**: the account's master key signs the request locally. Signing is a pure function
//!   of the verb, the target, the request date and the key, and never touches the network.
//! - **Delegated**: a narrower permission token is obtained from a [`PermissionResolver`], which
//!   may cache permissions and may perform network I/O of its own.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::{fmt, sync::Arc};

use crate::{
    address::{ResourceKind, Target},
    error::{AccessError, AccessResult},
    transport::Method,
};

type HmacSha256 = Hmac<Sha256>;

/// Access level a delegated permission must grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionMode {
    Read,
    All,
}

impl PermissionMode {
    /// Reads only need read permission, everything else needs full access.
    pub fn for_method(method: Method) -> Self {
        match method {
            Method::Get => PermissionMode::Read,
            _ => PermissionMode::All,
        }
    }
}

/// Resolves delegated permission tokens for a resource link.
///
/// Implementations are expected to return [`AccessError::PermissionDenied`] when no permission
/// covers the link, and may return any other error for lookup failures.
#[async_trait]
pub trait PermissionResolver: Send + Sync {
    async fn permission(&self, resource_link: &str, mode: PermissionMode) -> AccessResult<String>;
}

/// The credential a client authenticates with.
#[derive(Clone)]
pub enum Credential {
    /// Base64-encoded master key of the account.
    Owner { key: String },
    /// Permission tokens looked up per request.
    Delegated(Arc<dyn PermissionResolver>),
}

impl Credential {
    pub fn owner(key: impl Into<String>) -> Self {
        Credential::Owner { key: key.into() }
    }

    pub fn delegated(resolver: impl PermissionResolver + 'static) -> Self {
        Credential::Delegated(Arc::new(resolver))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Owner { .. } => f.write_str("Credential::Owner(..)"),
            Credential::Delegated(_) => f.write_str("Credential::Delegated(..)"),
        }
    }
}

/// A token minted for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLease {
    pub resource_link: String,
    pub method: Method,
    pub token: String,
    pub issued_at: DateTime<Utc>,
}

enum Mode {
    Owner { key: Vec<u8> },
    Delegated(Arc<dyn PermissionResolver>),
}

/// Mints authorization tokens for outgoing requests.
pub struct TokenAuthority {
    mode: Mode,
}

impl TokenAuthority {
    /// Creates an authority for `credential`.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::NotConfigured`] when an owner key is empty or not valid base64.
    pub fn new(credential: Credential) -> AccessResult<Self> {
        let mode = match credential {
            Credential::Owner { key } => {
                if key.trim().is_empty() {
                    return Err(AccessError::NotConfigured("owner key is empty".into()));
                }
                let key = STANDARD.decode(key.trim()).map_err(|e| {
                    AccessError::NotConfigured(format!("owner key is not valid base64: {e}"))
                })?;
                Mode::Owner { key }
            }
            Credential::Delegated(resolver) => Mode::Delegated(resolver),
        };

        Ok(Self { mode })
    }

    pub fn is_delegated(&self) -> bool {
        matches!(self.mode, Mode::Delegated(_))
    }

    /// Mints the token for `method` on `target` at request date `date`.
    ///
    /// The target is validated first so that a malformed address never costs a permission
    /// lookup.
    pub async fn token(
        &self,
        target: &Target,
        method: Method,
        date: DateTime<Utc>,
    ) -> AccessResult<TokenLease> {
        target.validate()?;
        let (resource_type, resource_link) = target.signing_parts();

        let token = match &self.mode {
            Mode::Owner { key } => {
                sign_master(key, method, resource_type, &resource_link, &http_date(date))?
            }
            Mode::Delegated(resolver) => {
                if !delegation_allowed(target) {
                    return Err(AccessError::PermissionDenied(format!(
                        "{target} requires an owner credential"
                    )));
                }

                let permission = resolver
                    .permission(&resource_link, PermissionMode::for_method(method))
                    .await
                    .map_err(|err| match err {
                        AccessError::PermissionDenied(_) | AccessError::Unknown(_) => err,
                        other => AccessError::Unknown(other.to_string()),
                    })?;

                urlencoding::encode(&permission).into_owned()
            }
        };

        Ok(TokenLease {
            resource_link,
            method,
            token,
            issued_at: date,
        })
    }
}

/// Account-level administration (databases, users, permissions) is never delegated.
fn delegation_allowed(target: &Target) -> bool {
    !matches!(
        target.kind(),
        ResourceKind::Database | ResourceKind::User | ResourceKind::Permission
    )
}

/// Formats `date` the way the `x-ms-date` header expects (RFC 1123).
pub fn http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Computes a master-key token over the canonical request description.
pub fn sign_master(
    key: &[u8],
    method: Method,
    resource_type: &str,
    resource_link: &str,
    date: &str,
) -> AccessResult<String> {
    let payload = format!(
        "{}\n{}\n{}\n{}\n\n",
        method.as_str().to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase(),
    );

    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AccessError::NotConfigured(format!("owner key rejected: {e}")))?;
    mac.update(payload.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(urlencoding::encode(&format!("type=master&ver=1.0&sig={signature}")).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ResourceAddress;
    use chrono::TimeZone;

    const KEY: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";

    struct FixedResolver;

    #[async_trait]
    impl PermissionResolver for FixedResolver {
        async fn permission(&self, link: &str, mode: PermissionMode) -> AccessResult<String> {
            match (link, mode) {
                ("dbs/D1/colls/C1", _) => Ok("type=resource&sig=abc".into()),
                _ => Err(AccessError::PermissionDenied(link.into())),
            }
        }
    }

    fn date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn collection() -> ResourceAddress {
        ResourceAddress::database("D1").child(ResourceKind::Collection, "C1")
    }

    #[test]
    fn test_http_date_format() {
        assert_eq!(http_date(date()), "Fri, 01 Mar 2024 12:00:00 GMT");
    }

    #[tokio::test]
    async fn test_owner_signing_is_deterministic() {
        let authority = TokenAuthority::new(Credential::owner(KEY)).unwrap();
        let target = Target::resource(collection());

        let first = authority.token(&target, Method::Get, date()).await.unwrap();
        let second = authority.token(&target, Method::Get, date()).await.unwrap();
        let other_verb = authority.token(&target, Method::Delete, date()).await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first.token, other_verb.token);
        assert!(first.token.starts_with("type%3Dmaster%26ver%3D1.0%26sig%3D"));
        assert_eq!(first.resource_link, "dbs/D1/colls/C1");
    }

    #[tokio::test]
    async fn test_owner_mode_rejects_malformed_address_without_signing() {
        let authority = TokenAuthority::new(Credential::owner(KEY)).unwrap();
        let target = Target::resource(ResourceAddress::database("bad/id"));

        assert!(matches!(
            authority.token(&target, Method::Get, date()).await,
            Err(AccessError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_invalid_owner_key_is_not_configured() {
        assert!(matches!(
            TokenAuthority::new(Credential::owner("not base64!!")),
            Err(AccessError::NotConfigured(_))
        ));
        assert!(matches!(
            TokenAuthority::new(Credential::owner("")),
            Err(AccessError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_delegated_mode() {
        let authority = TokenAuthority::new(Credential::delegated(FixedResolver)).unwrap();

        let lease = authority
            .token(&Target::resource(collection()), Method::Get, date())
            .await
            .unwrap();
        assert_eq!(lease.token, "type%3Dresource%26sig%3Dabc");

        let denied = authority
            .token(
                &Target::resource(collection().child(ResourceKind::Document, "x")),
                Method::Get,
                date(),
            )
            .await;
        assert!(matches!(denied, Err(AccessError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_delegated_mode_rejects_account_level_targets() {
        let authority = TokenAuthority::new(Credential::delegated(FixedResolver)).unwrap();

        for target in [
            Target::feed(None, ResourceKind::Database),
            Target::resource(ResourceAddress::database("D1")),
            Target::feed(Some(ResourceAddress::database("D1")), ResourceKind::User),
        ] {
            assert!(matches!(
                authority.token(&target, Method::Get, date()).await,
                Err(AccessError::PermissionDenied(_))
            ));
        }
    }
}
