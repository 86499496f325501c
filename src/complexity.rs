//! Website complexity profiling
//!
//! Classifies a target URL into a timeout/behavior profile from domain and
//! path heuristics. Pure and I/O free: anything unrecognised, including
//! URLs that fail to parse, gets the default profile.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteCategory {
    Marketplace,
    Saas,
    Ecommerce,
    Basic,
    Default,
}

/// Timeout and rendering expectations for one category of site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityProfile {
    pub category: SiteCategory,
    pub timeout_ms: u64,
    pub requires_dynamic_rendering: bool,
    pub expected_load_ms: u64,
}

impl ComplexityProfile {
    pub const fn for_category(category: SiteCategory) -> Self {
        let (timeout_ms, requires_dynamic_rendering, expected_load_ms) = match category {
            SiteCategory::Marketplace => (45_000, true, 8_000),
            SiteCategory::Saas => (30_000, true, 5_000),
            SiteCategory::Ecommerce => (35_000, true, 6_000),
            SiteCategory::Basic => (15_000, false, 2_000),
            SiteCategory::Default => (20_000, false, 4_000),
        };

        Self {
            category,
            timeout_ms,
            requires_dynamic_rendering,
            expected_load_ms,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ComplexityProfile {
    fn default() -> Self {
        Self::for_category(SiteCategory::Default)
    }
}

struct Rule {
    category: SiteCategory,
    /// Matched against whole host labels ("amazon" hits amazon.co.uk, not amazonia.com).
    host_keywords: &'static [&'static str],
    host_prefixes: &'static [&'static str],
    host_suffixes: &'static [&'static str],
    path_prefixes: &'static [&'static str],
}

const RULES: &[Rule] = &[
    Rule {
        category: SiteCategory::Marketplace,
        host_keywords: &[
            "amazon",
            "ebay",
            "etsy",
            "alibaba",
            "aliexpress",
            "walmart",
            "mercadolibre",
            "rakuten",
        ],
        host_prefixes: &[],
        host_suffixes: &[],
        path_prefixes: &["/marketplace"],
    },
    Rule {
        category: SiteCategory::Saas,
        host_keywords: &[
            "salesforce",
            "hubspot",
            "atlassian",
            "notion",
            "slack",
            "zendesk",
            "intercom",
        ],
        host_prefixes: &["app.", "dashboard."],
        host_suffixes: &[],
        path_prefixes: &["/pricing", "/features", "/signup"],
    },
    Rule {
        category: SiteCategory::Ecommerce,
        host_keywords: &["shopify", "myshopify", "bigcommerce", "woocommerce"],
        host_prefixes: &["shop.", "store."],
        host_suffixes: &[],
        path_prefixes: &["/product", "/cart", "/checkout", "/collections"],
    },
    Rule {
        category: SiteCategory::Basic,
        host_keywords: &["wikipedia"],
        host_prefixes: &["docs.", "blog."],
        host_suffixes: &[".github.io", ".gov", ".edu"],
        path_prefixes: &["/blog", "/docs", "/about"],
    },
];

impl Rule {
    fn matches(&self, host: &str, path: &str) -> bool {
        let labels: Vec<&str> = host.split('.').collect();

        self.host_keywords.iter().any(|k| labels.contains(k))
            || self.host_prefixes.iter().any(|p| host.starts_with(p))
            || self.host_suffixes.iter().any(|s| host.ends_with(s))
            || self.path_prefixes.iter().any(|p| path_has_segment_prefix(path, p))
    }
}

/// `/product` matches `/product`, `/products/1` and `/product/x`, not `/productivity-tips`.
fn path_has_segment_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest == "s" || rest.starts_with("s/"),
        None => false,
    }
}

/// Classifies a URL into a [`ComplexityProfile`].
///
/// # Examples
///
/// ```rust
/// use capture_optimizer::{classify, SiteCategory};
///
/// assert_eq!(classify("https://www.amazon.com/dp/B000").category, SiteCategory::Marketplace);
/// assert_eq!(classify("https://example.org").category, SiteCategory::Default);
/// ```
pub fn classify(url: &str) -> ComplexityProfile {
    let Ok(parsed) = Url::parse(url) else {
        return ComplexityProfile::default();
    };
    let Some(host) = parsed.host_str() else {
        return ComplexityProfile::default();
    };

    let host = host.to_lowercase();
    let path = parsed.path().to_lowercase();

    RULES
        .iter()
        .find(|rule| rule.matches(&host, &path))
        .map(|rule| ComplexityProfile::for_category(rule.category))
        .unwrap_or_default()
}
