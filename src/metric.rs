//! Metric normalization and catalog.
//!
//! Turns raw wire metric maps into canonical points:
//!
//! - [`split_key`]: `iface.<name>.<field>` wire keys into `(iface.<field>, name)`
//! - [`MetricValue`]: tagged numeric-or-text value
//! - [`CatalogEntry`]: typed catalog lookup with auto-registration of unknown keys
//! - [`counter_rate`]: delta-to-rate conversion with counter-reset suppression

mod catalog;
pub mod format;
mod key;
pub mod parse;
mod rate;
mod value;

pub use catalog::{CatalogEntry, MetricCategory, MetricKind, MetricUnit, default_catalog};
pub use key::{humanize_key, interface_key, rate_key, split_key};
pub use rate::{RateOutcome, counter_rate};
pub use value::{MetricMap, MetricValue};
