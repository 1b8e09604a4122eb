use std::{ops::Deref, sync::Arc};

use reqwest::{Client, ClientBuilder, IntoUrl};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};

use crate::error::{KisekiError, KisekiResult};

/// A reqwest client sharing one cookie store across every segment request.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cookies_store: Arc<CookieStoreMutex>,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> KisekiResult<Self> {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = builder
            .cookie_provider(cookies_store.clone())
            .build()
            .map_err(KisekiError::HttpClientBuild)?;

        Ok(Self {
            client,
            cookies_store,
        })
    }

    pub fn add_cookies(&self, cookies: Vec<String>, url: impl IntoUrl) -> KisekiResult<()> {
        let url = url.into_url()?;
        let mut lock = match self.cookies_store.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        for cookie in cookies {
            if let Err(e) = lock.parse(&cookie, &url) {
                tracing::warn!(%url, error = %e, "Ignoring invalid cookie");
            }
        }
        Ok(())
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
