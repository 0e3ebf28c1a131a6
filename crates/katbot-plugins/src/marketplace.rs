//! Marketplace lookup interface.
//!
//! No distribution protocol ships with Katbot; [`UnconfiguredMarketplace`]
//! answers every request with [`PluginError::NotImplemented`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// A plugin listing returned by a marketplace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceListing {
    /// Plugin id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Latest published version.
    pub version: String,
    /// Short description.
    #[serde(default)]
    pub description: String,
    /// Author.
    pub author: String,
    /// Category, if any.
    #[serde(default)]
    pub category: Option<String>,
}

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplacePage {
    /// Listings on this page.
    pub items: Vec<MarketplaceListing>,
    /// 1-based page number.
    pub page: u32,
    /// Requested page size.
    pub page_size: u32,
    /// Total matching listings.
    pub total: u64,
}

/// Remote plugin catalogue.
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Search listings.
    async fn search(&self, query: &str, page: u32, page_size: u32) -> PluginResult<MarketplacePage>;

    /// Fetch one listing.
    async fn get_plugin(&self, id: &str) -> PluginResult<Option<MarketplaceListing>>;

    /// Known categories.
    async fn get_categories(&self) -> PluginResult<Vec<String>>;
}

/// The marketplace used when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredMarketplace;

#[async_trait]
impl Marketplace for UnconfiguredMarketplace {
    async fn search(&self, _query: &str, _page: u32, _page_size: u32) -> PluginResult<MarketplacePage> {
        Err(PluginError::NotImplemented("marketplace search".into()))
    }

    async fn get_plugin(&self, _id: &str) -> PluginResult<Option<MarketplaceListing>> {
        Err(PluginError::NotImplemented("marketplace lookup".into()))
    }

    async fn get_categories(&self) -> PluginResult<Vec<String>> {
        Err(PluginError::NotImplemented("marketplace categories".into()))
    }
}
