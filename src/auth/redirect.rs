//! Post-login redirect target resolution
//!
//! The client supplies a base64-encoded `return` hint. A purely numeric
//! hint names an internal content item; anything else must be judged
//! internal to survive. Each context has its own fallback default, and
//! the administrative context additionally rejects targets carrying the
//! embedded-template marker.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sqlx::PgPool;

/// Default front-end target: the user's own profile page
pub const SITE_DEFAULT_RETURN: &str = "index.php?option=com_users&view=profile";
/// Default administrative target: the dashboard
pub const ADMIN_DEFAULT_RETURN: &str = "index.php";
/// Embedded-template marker never allowed in an admin return target
const UNSAFE_TEMPLATE_MARKER: &str = "tmpl=component";

/// Content-language lookup for internal menu items
#[async_trait]
pub trait MenuLanguageLookup: Send + Sync {
    /// Language code of a front-end menu item; `None` when the item is
    /// unknown
    async fn language_for_item(&self, item_id: i64) -> Result<Option<String>, sqlx::Error>;
}

/// Postgres-backed lookup over the host's `menu` table
pub struct PgMenuLanguageLookup {
    pool: PgPool,
}

impl PgMenuLanguageLookup {
    /// Create a lookup over the given pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MenuLanguageLookup for PgMenuLanguageLookup {
    async fn language_for_item(&self, item_id: i64) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            r"
            SELECT language
            FROM menu
            WHERE client_id = 0 AND id = $1
            ",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
    }
}

/// Decode the client's base64 `return` hint; malformed input decodes to
/// empty (and therefore to the context default)
#[must_use]
pub fn decode_return(encoded: &str) -> String {
    BASE64
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default()
}

/// Judge whether a return target stays inside this deployment.
///
/// Relative paths are internal; protocol-relative and scheme-carrying
/// targets are internal only when rooted under the deployment base URL.
#[must_use]
pub fn is_internal(url: &str, base_url: &str) -> bool {
    if url.is_empty() || url.starts_with("//") {
        return false;
    }

    // A colon before the first path separator means a scheme is present
    let head = url.split(['/', '?', '#']).next().unwrap_or("");
    if head.contains(':') {
        // The base must match up to a boundary character, otherwise
        // "https://host.evil.net" slips past a prefix test
        let base = base_url.trim_end_matches('/');
        return url == base
            || url
                .strip_prefix(base)
                .is_some_and(|rest| rest.starts_with(['/', '?', '#']));
    }

    true
}

/// Resolve the front-end redirect target.
///
/// A numeric hint is an internal content-item id and synthesizes
/// `index.php?Itemid=N`; with multilingual routing active, the item's
/// language code is appended unless it is the all-languages marker `*`.
///
/// # Errors
///
/// Returns error if the menu-language lookup fails.
pub async fn resolve_site_return(
    decoded: &str,
    base_url: &str,
    multilingual: bool,
    menu: &dyn MenuLanguageLookup,
) -> Result<String, sqlx::Error> {
    let mut target = decoded.to_string();

    if let Ok(item_id) = decoded.parse::<i64>() {
        target = format!("index.php?Itemid={item_id}");

        if multilingual {
            if let Some(language) = menu.language_for_item(item_id).await? {
                if language != "*" {
                    target.push_str(&format!("&lang={language}"));
                }
            }
        }
    } else if !is_internal(&target, base_url) {
        // Never redirect to an external URL
        target.clear();
    }

    if target.is_empty() {
        target = SITE_DEFAULT_RETURN.to_string();
    }

    Ok(target)
}

/// Resolve the administrative redirect target
#[must_use]
pub fn resolve_admin_return(decoded: &str, base_url: &str) -> String {
    if decoded.is_empty()
        || !is_internal(decoded, base_url)
        || decoded.contains(UNSAFE_TEMPLATE_MARKER)
    {
        ADMIN_DEFAULT_RETURN.to_string()
    } else {
        decoded.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticMenuLanguages;

    const BASE: &str = "https://www.example.com/";

    #[test]
    fn test_decode_return() {
        assert_eq!(decode_return("NQ=="), "5"); // "5"
        assert_eq!(decode_return(""), "");
        assert_eq!(decode_return("%%%not-base64%%%"), "");
    }

    #[test]
    fn test_is_internal() {
        assert!(is_internal("index.php?Itemid=5", BASE));
        assert!(is_internal("/articles/42", BASE));
        assert!(is_internal("https://www.example.com/page", BASE));
        assert!(!is_internal("https://evil.example.net/", BASE));
        assert!(!is_internal("//evil.example.net/", BASE));
        assert!(!is_internal("javascript:alert(1)", BASE));
        assert!(!is_internal("", BASE));
    }

    #[test]
    fn test_is_internal_rejects_host_extension_of_the_base() {
        // base configured without a trailing slash must not turn a
        // longer host into an internal target
        let bare = "https://www.example.com";
        assert!(!is_internal("https://www.example.com.evil.net/phish", bare));
        assert!(!is_internal("https://www.example.com.evil.net/phish", BASE));

        assert!(is_internal("https://www.example.com", bare));
        assert!(is_internal("https://www.example.com/page", bare));
        assert!(is_internal("https://www.example.com?view=profile", bare));
    }

    #[tokio::test]
    async fn test_host_extension_return_falls_back_to_profile() {
        let menu = StaticMenuLanguages::default();
        let target = resolve_site_return(
            "https://www.example.com.evil.net/phish",
            "https://www.example.com",
            false,
            &menu,
        )
        .await
        .unwrap();
        assert_eq!(target, SITE_DEFAULT_RETURN);
    }

    #[tokio::test]
    async fn test_numeric_return_without_multilingual() {
        let menu = StaticMenuLanguages::default();
        let target = resolve_site_return("5", BASE, false, &menu).await.unwrap();
        assert_eq!(target, "index.php?Itemid=5");
    }

    #[tokio::test]
    async fn test_numeric_return_with_language_annotation() {
        let menu = StaticMenuLanguages::with_items([(5, "en-GB"), (6, "*")]);

        let target = resolve_site_return("5", BASE, true, &menu).await.unwrap();
        assert_eq!(target, "index.php?Itemid=5&lang=en-GB");

        // the all-languages marker is not appended
        let target = resolve_site_return("6", BASE, true, &menu).await.unwrap();
        assert_eq!(target, "index.php?Itemid=6");
    }

    #[tokio::test]
    async fn test_external_return_falls_back_to_profile() {
        let menu = StaticMenuLanguages::default();
        let target = resolve_site_return("https://evil.example.net/", BASE, false, &menu)
            .await
            .unwrap();
        assert_eq!(target, SITE_DEFAULT_RETURN);
    }

    #[tokio::test]
    async fn test_empty_return_falls_back_to_profile() {
        let menu = StaticMenuLanguages::default();
        let target = resolve_site_return("", BASE, false, &menu).await.unwrap();
        assert_eq!(target, SITE_DEFAULT_RETURN);
    }

    #[test]
    fn test_admin_return_rejects_template_marker() {
        assert_eq!(
            resolve_admin_return("index.php?option=com_foo&tmpl=component", BASE),
            ADMIN_DEFAULT_RETURN
        );
        assert_eq!(
            resolve_admin_return("https://evil.example.net/", BASE),
            ADMIN_DEFAULT_RETURN
        );
        assert_eq!(
            resolve_admin_return("index.php?option=com_foo", BASE),
            "index.php?option=com_foo"
        );
    }
}
