// 🩺 Link Health - per product, per vendor
// Alive / Dead / OutOfStock and the rules that move a link between them
//
// Automatic transitions come from fetch outcomes. OutOfStock is an operator
// override: the sweep never enters or leaves it on its own.

use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::vendor::Vendor;

/// Price shown while an operator has declared the item out of stock
pub const OUT_OF_STOCK_PRICE: &str = "Out of stock";

/// Result of asking a vendor for the current price
pub type FetchOutcome = Result<String, FetchError>;

// ============================================================================
// STATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkHealth {
    #[default]
    Alive,
    Dead,
    OutOfStock,
}

impl LinkHealth {
    /// Storage code
    pub fn code(&self) -> &'static str {
        match self {
            LinkHealth::Alive => "alive",
            LinkHealth::Dead => "dead",
            LinkHealth::OutOfStock => "out_of_stock",
        }
    }

    pub fn from_code(code: &str) -> Option<LinkHealth> {
        match code {
            "alive" => Some(LinkHealth::Alive),
            "dead" => Some(LinkHealth::Dead),
            "out_of_stock" => Some(LinkHealth::OutOfStock),
            _ => None,
        }
    }
}

/// What a single fetch did to a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Nothing persisted changed
    Unchanged,
    /// Alive link observed a different price
    PriceUpdated { previous: String },
    /// Alive link failed to fetch; this is the dead-link event
    WentDead,
    /// Dead link fetched successfully again
    Recovered { previous_price: String },
}

impl Transition {
    pub fn is_dead_link_event(&self) -> bool {
        matches!(self, Transition::WentDead)
    }

    pub fn is_change(&self) -> bool {
        !matches!(self, Transition::Unchanged)
    }
}

// ============================================================================
// DATA MODEL
// ============================================================================

/// VendorLink - one (catalog entry, vendor) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorLink {
    pub vendor: Vendor,

    /// Product page handed to the fetcher; empty means "not tracked"
    pub url: String,

    /// Last successfully observed price, kept verbatim across failures
    pub last_known_price: String,

    pub health: LinkHealth,
}

impl VendorLink {
    /// New link starts Alive with no observed price
    pub fn new(vendor: Vendor, url: &str) -> Self {
        VendorLink {
            vendor,
            url: url.trim().to_string(),
            last_known_price: String::new(),
            health: LinkHealth::Alive,
        }
    }

    /// Builder pattern: seed a known price
    pub fn with_price(mut self, price: &str) -> Self {
        self.last_known_price = price.to_string();
        self
    }

    /// Builder pattern: start in a given state
    pub fn with_health(mut self, health: LinkHealth) -> Self {
        self.health = health;
        self
    }

    /// Only links with a url are visited by the sweep
    pub fn is_tracked(&self) -> bool {
        !self.url.trim().is_empty()
    }

    /// Apply one fetch outcome
    ///
    /// | current    | success              | failure          |
    /// |------------|----------------------|------------------|
    /// | Alive      | Alive, price updated | Dead, event      |
    /// | Dead       | Alive, price updated | Dead, no event   |
    /// | OutOfStock | unchanged            | unchanged        |
    pub fn apply_fetch(&mut self, outcome: &FetchOutcome) -> Transition {
        match (self.health, outcome) {
            (LinkHealth::OutOfStock, _) => Transition::Unchanged,

            (LinkHealth::Alive, Ok(price)) => {
                if self.last_known_price == *price {
                    Transition::Unchanged
                } else {
                    let previous = std::mem::replace(&mut self.last_known_price, price.clone());
                    Transition::PriceUpdated { previous }
                }
            }

            (LinkHealth::Dead, Ok(price)) => {
                let previous_price = std::mem::replace(&mut self.last_known_price, price.clone());
                self.health = LinkHealth::Alive;
                Transition::Recovered { previous_price }
            }

            (LinkHealth::Alive, Err(_)) => {
                self.health = LinkHealth::Dead;
                Transition::WentDead
            }

            (LinkHealth::Dead, Err(_)) => Transition::Unchanged,
        }
    }

    /// Operator action: declare the item out of stock
    ///
    /// Valid from any state. Clears Dead and forces the sentinel price.
    pub fn mark_out_of_stock(&mut self) -> bool {
        let changed =
            self.health != LinkHealth::OutOfStock || self.last_known_price != OUT_OF_STOCK_PRICE;

        self.health = LinkHealth::OutOfStock;
        self.last_known_price = OUT_OF_STOCK_PRICE.to_string();

        changed
    }

    /// Operator action: lift the out-of-stock override
    ///
    /// The link goes back to Alive; the sentinel price stays until the next
    /// successful fetch replaces it. No-op outside OutOfStock.
    pub fn clear_out_of_stock(&mut self) -> bool {
        if self.health != LinkHealth::OutOfStock {
            return false;
        }

        self.health = LinkHealth::Alive;
        true
    }
}

/// CatalogEntry - one reviewed product and its vendor links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub links: Vec<VendorLink>,
}

impl CatalogEntry {
    pub fn new(id: i64, name: &str, category: &str) -> Self {
        CatalogEntry {
            id,
            name: name.to_string(),
            category: category.to_string(),
            links: Vec::new(),
        }
    }

    /// Builder pattern: add or replace the link for one vendor
    pub fn with_link(mut self, link: VendorLink) -> Self {
        self.links.retain(|l| l.vendor != link.vendor);
        self.links.push(link);
        self.links.sort_by_key(|l| l.vendor);
        self
    }

    pub fn link(&self, vendor: Vendor) -> Option<&VendorLink> {
        self.links.iter().find(|l| l.vendor == vendor)
    }

    pub fn tracked_links(&self) -> impl Iterator<Item = &VendorLink> {
        self.links.iter().filter(|l| l.is_tracked())
    }
}
