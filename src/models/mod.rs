//! Data models for extracted listings, cache entries and run summaries

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! fields {
    ($($variant:ident => $key:literal, $column:literal;)+) => {
        /// Logical output field of a listing row.
        ///
        /// `key` is the rule name used in client configuration files,
        /// `column` is the spreadsheet header and the cache storage name.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum Field {
            $(#[serde(rename = $column)] $variant,)+
        }

        impl Field {
            /// Every field, in spreadsheet column order.
            pub const ALL: &'static [Field] = &[$(Field::$variant,)+];

            pub fn key(self) -> &'static str {
                match self {
                    $(Field::$variant => $key,)+
                }
            }

            pub fn column(self) -> &'static str {
                match self {
                    $(Field::$variant => $column,)+
                }
            }

            pub fn from_key(key: &str) -> Option<Self> {
                match key {
                    $($key => Some(Field::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

fields! {
    Title => "listingTitle", "title";
    Brand => "listingBrand", "brand";
    Address => "listingAddress", "address";
    City => "listingCity", "city";
    Link => "listingDetailPageUrl", "link";
    ImageLink => "listingImage", "image_link";
    ImageTag => "listingImageTag", "image_tag";
    Description => "listingDescription", "description";
    SalePrice => "listingSalePrice", "sale_price";
    Price => "listingPrice", "price";
    Latitude => "listingLatitude", "latitude";
    Longitude => "listingLongitude", "longitude";
    Neighborhood => "listingNeighborhood", "neighborhood";
    LoyaltyProgram => "listingLoyaltyProgram", "loyalty_program";
    MarginLevel => "listingMarginLevel", "margin_level";
    StarRating => "listingStarRating", "star_rating";
    Address2 => "listingAddress2", "address2";
    Address3 => "listingAddress3", "address3";
    CityId => "listingCityId", "city_id";
    Region => "listingRegion", "region";
    PostalCode => "listingPostalCode", "postal_code";
    UnitNumber => "listingUnitNumber", "unit_number";
    Priority => "listingPriority", "priority";
    NumberOfRooms => "listingNumberOfRooms", "number_of_rooms";
    AndroidAppName => "listingAndroidAppName", "android_app_name";
    AndroidPackage => "listingAndroidPackage", "android_package";
    AndroidUrl => "listingAndroidUrl", "android_url";
    IosAppName => "listingIosAppName", "ios_app_name";
    IosAppStoreId => "listingIosAppStoreId", "ios_app_store_id";
    IosUrl => "listingIosUrl", "ios_url";
    IpadAppName => "listingIpadAppName", "ipad_app_name";
    IpadAppStoreId => "listingIpadAppStoreId", "ipad_app_store_id";
    IpadUrl => "listingIpadUrl", "ipad_url";
    IphoneAppName => "listingIphoneAppName", "iphone_app_name";
    IphoneAppStoreId => "listingIphoneAppStoreId", "iphone_app_store_id";
    IphoneUrl => "listingIphoneUrl", "iphone_url";
    WindowsPhoneAppId => "listingWindowsPhoneAppId", "windows_phone_app_id";
    WindowsPhoneAppName => "listingWindowsPhoneAppName", "windows_phone_app_name";
    WindowsPhoneUrl => "listingWindowsPhoneUrl", "windows_phone_url";
    VideoUrl => "listingVideoUrl", "video_url";
    VideoTag => "listingVideoTag", "video_tag";
    Category => "listingCategory", "category";
}

impl Field {
    pub fn is_price(self) -> bool {
        matches!(self, Field::Price | Field::SalePrice)
    }

    /// Fields that must resolve when they are configured on the detail page.
    pub fn required_on_detail_page(self) -> bool {
        matches!(self, Field::Title | Field::ImageLink)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// Fields resolved from a detail page, merged into a [`ListingRecord`].
pub type PartialRecord = BTreeMap<Field, String>;

/// One listing extracted for a client, partial until detail enrichment finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub client_id: String,
    fields: BTreeMap<Field, String>,
}

impl ListingRecord {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    /// Stores `value` for `field`; empty values mean "not resolved" and are skipped.
    pub fn set(&mut self, field: Field, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            return;
        }
        self.fields.insert(field, value);
    }

    pub fn link(&self) -> Option<&str> {
        self.get(Field::Link)
    }

    /// Detail-page values win; listing values survive where the detail page gave nothing.
    pub fn merge(&mut self, partial: PartialRecord) {
        for (field, value) in partial {
            self.set(field, value);
        }
    }

    /// Stable row identifier derived from the client and detail link.
    pub fn id(&self) -> String {
        let link = self.link().unwrap_or_default();
        format!("{:x}", md5::compute(format!("{}:{}", self.client_id, link)))
    }
}

/// A cached scrape for one client key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub timestamp: DateTime<Utc>,
    pub data: Vec<ListingRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFailure {
    pub name: String,
    pub reason: String,
}

/// Outcome of a multi-client run.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub successful_clients: Vec<String>,
    pub failed_clients: Vec<ClientFailure>,
    pub rows: Vec<ListingRecord>,
}

impl RunResult {
    pub fn is_total_failure(&self) -> bool {
        self.successful_clients.is_empty() && !self.failed_clients.is_empty()
    }

    /// Human readable completion message.
    pub fn summary(&self) -> String {
        let mut summary = format!("Scraped {} rows.", self.rows.len());

        if !self.successful_clients.is_empty() {
            summary.push_str(&format!(
                " Succeeded: {}.",
                self.successful_clients.join(", ")
            ));
        }

        if !self.failed_clients.is_empty() {
            let failed: Vec<String> = self
                .failed_clients
                .iter()
                .map(|f| format!("{} ({})", f.name, f.reason))
                .collect();
            summary.push_str(&format!(" Failed: {}.", failed.join(", ")));
        }

        summary
    }
}
