//! Persistent cookie-bearing HTTP session shared by every provider call.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::redirect::Policy;
use reqwest::Client;

use crate::error::Result;

/// Per-request timeout; a hung provider call fails instead of stalling the
/// whole poll.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36";

/// Cookie-sharing HTTP client pair.
///
/// The B2C login flow sets cookies on the authorize page that every later
/// step depends on, and the confirm step needs to see the redirect
/// `Location` itself, so a second client with redirects disabled shares
/// the same jar.
#[derive(Debug, Clone)]
pub struct Session {
    client: Client,
    no_redirect: Client,
}

impl Session {
    pub fn new() -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_provider(jar.clone())
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let no_redirect = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_provider(jar)
            .redirect(Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            no_redirect,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Client that surfaces 3xx responses instead of following them.
    pub fn no_redirect(&self) -> &Client {
        &self.no_redirect
    }
}
