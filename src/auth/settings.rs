//! Scraping helpers for the B2C login pages.
//!
//! The authorize endpoint returns an HTML page embedding a
//! `var SETTINGS = {...};` blob carrying the transaction id and CSRF token
//! the rest of the flow needs. The parsing is coupled to the provider's
//! page structure, so it is isolated here and tested against fixture pages.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Routing state recovered from the embedded SETTINGS blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSettings {
    pub transaction_id: String,
    pub csrf_token: Option<String>,
    pub tenant: String,
    pub policy: String,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(rename = "transId")]
    trans_id: Option<String>,
    csrf: Option<String>,
    #[serde(default)]
    hosts: RawHosts,
}

#[derive(Debug, Default, Deserialize)]
struct RawHosts {
    tenant: Option<String>,
    policy: Option<String>,
}

fn settings_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)var SETTINGS = (\{.*?\})\s*;").expect("valid regex"))
}

/// Pull the transaction id, CSRF token, and tenant/policy routing out of a
/// login page. Failure to locate or parse the blob is a fatal
/// authentication error.
pub fn extract_login_settings(page: &str) -> Result<LoginSettings> {
    let captures = settings_regex()
        .captures(page)
        .ok_or_else(|| Error::flow("Unable to parse B2C settings."))?;
    let raw: RawSettings = serde_json::from_str(&captures[1])
        .map_err(|_| Error::flow("Unable to parse B2C settings."))?;

    let transaction_id = raw.trans_id.filter(|value| !value.is_empty());
    let tenant = raw.hosts.tenant.filter(|value| !value.is_empty());
    let policy = raw.hosts.policy.filter(|value| !value.is_empty());
    match (transaction_id, tenant, policy) {
        (Some(transaction_id), Some(tenant), Some(policy)) => Ok(LoginSettings {
            transaction_id,
            csrf_token: raw.csrf.filter(|value| !value.is_empty()),
            tenant,
            policy,
        }),
        _ => Err(Error::flow("Missing B2C settings fields.")),
    }
}

/// Pull an OAuth `code` query parameter out of a redirect target.
///
/// Works on full URLs (Location headers, final redirect URLs) and on loose
/// text that merely contains a `?code=...` query, which is how the confirm
/// endpoint sometimes embeds it in a response body. In the loose-text case
/// the surrounding markup trails right after the code, so the value is cut
/// at the first character outside the code alphabet.
pub fn extract_auth_code(target: &str) -> Option<String> {
    let (_, rest) = target.split_once('?')?;
    let query = rest.split('#').next().unwrap_or(rest);
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "code")
        .map(|(_, value)| {
            value
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'))
                .collect::<String>()
        })
        .filter(|code| !code.is_empty())
}
