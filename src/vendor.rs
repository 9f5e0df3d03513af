// 🏔️ Vendor Fetchers
// One price fetcher per retailer behind a single trait

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, USER_AGENT};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::FetchError;

// ============================================================================
// CORE TYPES
// ============================================================================

/// Vendor - third-party retailer whose product page carries a price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    Moosejaw,
    Rei,
    Backcountry,
}

impl Vendor {
    /// Every supported vendor, in display order
    pub const ALL: [Vendor; 3] = [Vendor::Moosejaw, Vendor::Rei, Vendor::Backcountry];

    /// Human-readable name for display
    pub fn name(&self) -> &'static str {
        match self {
            Vendor::Moosejaw => "Moosejaw",
            Vendor::Rei => "REI",
            Vendor::Backcountry => "Backcountry",
        }
    }

    /// Stable code used in storage, URLs and CSV headers
    pub fn code(&self) -> &'static str {
        match self {
            Vendor::Moosejaw => "moosejaw",
            Vendor::Rei => "rei",
            Vendor::Backcountry => "backcountry",
        }
    }

    pub fn from_code(code: &str) -> Option<Vendor> {
        let code = code.trim().to_lowercase();
        Vendor::ALL.into_iter().find(|v| v.code() == code)
    }

    /// CSS selector of the element holding the price on this vendor's page
    pub fn price_selector(&self) -> &'static str {
        match self {
            Vendor::Moosejaw => ".price-option",
            Vendor::Rei => ".price-value",
            Vendor::Backcountry => ".css-17wknbl",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// FETCHER CONTRACT
// ============================================================================

/// PriceFetcher - the only thing the monitor knows about a vendor's page
///
/// Implementations must be callable from worker threads. A fetch either
/// yields the price text verbatim or a [`FetchError`]; the monitor never
/// looks at the page itself.
pub trait PriceFetcher: Send + Sync {
    /// Vendor this fetcher handles
    fn vendor(&self) -> Vendor;

    /// Fetch the current price shown at `url`
    fn fetch_price(&self, url: &str) -> Result<String, FetchError>;
}

// Headers the vendor sites expect from a regular browser
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/98.0.4758.102 Safari/537.36";
const BROWSER_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9,lb;q=0.8,fr;q=0.7";

/// Build the blocking HTTP client shared by all vendor fetchers
pub fn build_client(timeout: Duration) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(BROWSER_ACCEPT_LANGUAGE));

    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// Pull the price text out of a vendor page
///
/// The first element matching `selector` wins. Whitespace around the text is
/// dropped; an element with no text counts as missing.
pub fn extract_price(html: &str, selector: &str, vendor: Vendor) -> Result<String, FetchError> {
    let selector = Selector::parse(selector)
        .map_err(|e| FetchError::extraction(vendor, format!("invalid selector {selector}: {e}")))?;

    let document = Html::parse_document(html);
    let element = document
        .select(&selector)
        .next()
        .ok_or_else(|| FetchError::extraction(vendor, "price element missing"))?;

    let text = element.text().collect::<String>();
    let price = text.trim();

    if price.is_empty() {
        return Err(FetchError::extraction(vendor, "price element is empty"));
    }

    Ok(price.to_string())
}

/// HttpPriceFetcher - downloads the product page and reads the price element
pub struct HttpPriceFetcher {
    vendor: Vendor,
    selector: String,
    client: Client,
    timeout: Duration,
}

impl HttpPriceFetcher {
    /// Fetcher using the vendor's default price selector
    pub fn new(vendor: Vendor, client: Client, timeout: Duration) -> Self {
        HttpPriceFetcher {
            vendor,
            selector: vendor.price_selector().to_string(),
            client,
            timeout,
        }
    }

    /// Builder pattern: override the price selector
    pub fn with_selector(mut self, selector: &str) -> Result<Self> {
        Selector::parse(selector)
            .map_err(|e| anyhow::anyhow!("Invalid price selector {}: {}", selector, e))?;
        self.selector = selector.to_string();
        Ok(self)
    }

    fn map_transport(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

impl PriceFetcher for HttpPriceFetcher {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    fn fetch_price(&self, url: &str) -> Result<String, FetchError> {
        let body = self
            .client
            .get(url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.text())
            .map_err(|e| self.map_transport(e))?;

        extract_price(&body, &self.selector, self.vendor)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// FetcherSet - which fetcher handles which vendor
///
/// Factory pattern like the parser registry: the sweep asks for a vendor and
/// gets a shared trait object back.
#[derive(Clone, Default)]
pub struct FetcherSet {
    fetchers: HashMap<Vendor, Arc<dyn PriceFetcher>>,
}

impl FetcherSet {
    pub fn new() -> Self {
        FetcherSet::default()
    }

    /// The three HTTP fetchers, sharing one client
    pub fn http(timeout: Duration) -> Result<Self> {
        let client = build_client(timeout)?;

        let mut set = FetcherSet::new();
        for vendor in Vendor::ALL {
            set.register(Arc::new(HttpPriceFetcher::new(vendor, client.clone(), timeout)));
        }

        Ok(set)
    }

    /// Register a fetcher, replacing any previous one for the same vendor
    pub fn register(&mut self, fetcher: Arc<dyn PriceFetcher>) {
        self.fetchers.insert(fetcher.vendor(), fetcher);
    }

    /// Builder pattern: add a fetcher
    pub fn with(mut self, fetcher: Arc<dyn PriceFetcher>) -> Self {
        self.register(fetcher);
        self
    }

    pub fn get(&self, vendor: Vendor) -> Option<Arc<dyn PriceFetcher>> {
        self.fetchers.get(&vendor).cloned()
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }
}
