//! Caller-facing configuration for paginated listings.
//!
//! The order listing in [`crate::orders`] trusts the [`PageRequest`] it is
//! given; clamping raw page and limit values happens here, at the edge.

use std::env;

use nutype::nutype;
use thiserror::Error;

/// Environment variable holding the default page size.
pub const DEFAULT_PAGE_LIMIT_ENV: &str = "STOREFRONT_DEFAULT_PAGE_LIMIT";
/// Environment variable holding the largest page size a caller may request.
pub const MAX_PAGE_LIMIT_ENV: &str = "STOREFRONT_MAX_PAGE_LIMIT";

/// Number of rows per page.
///
/// Bounded to `1..=100` so a single listing can never fan out into an
/// unbounded batch of product reads.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    default = 10,
    derive(
        Debug,
        Default,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct PageLimit(u32);

/// Errors raised while reading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The variable is set but is not a number.
    #[error("{variable} must be an integer, got `{value}`")]
    NotANumber {
        /// Variable name.
        variable: &'static str,
        /// Raw value found.
        value: String,
    },

    /// The variable is a number outside `1..=100`.
    #[error("{variable} must be between 1 and 100, got {value}")]
    OutOfRange {
        /// Variable name.
        variable: &'static str,
        /// Parsed value found.
        value: u64,
    },

    /// The default page size is larger than the maximum.
    #[error("default page limit {default_limit} exceeds maximum {max_limit}")]
    DefaultExceedsMax {
        /// Configured default.
        default_limit: PageLimit,
        /// Configured maximum.
        max_limit: PageLimit,
    },
}

/// Pagination defaults applied by [`PageRequest::clamped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationConfig {
    /// Page size used when the caller sends none, zero or a negative value (default: 10)
    pub default_limit: PageLimit,
    /// Largest page size honored (default: 100)
    pub max_limit: PageLimit,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_limit: PageLimit::default(),
            max_limit: PageLimit::try_new(100).unwrap_or_default(),
        }
    }
}

impl PaginationConfig {
    /// Build a configuration, rejecting a default larger than the maximum.
    pub fn new(default_limit: PageLimit, max_limit: PageLimit) -> Result<Self, ConfigError> {
        if default_limit > max_limit {
            return Err(ConfigError::DefaultExceedsMax {
                default_limit,
                max_limit,
            });
        }
        Ok(Self {
            default_limit,
            max_limit,
        })
    }

    /// Read `STOREFRONT_DEFAULT_PAGE_LIMIT` and `STOREFRONT_MAX_PAGE_LIMIT`,
    /// falling back to the defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`PaginationConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let default_limit =
            read_limit(&lookup, DEFAULT_PAGE_LIMIT_ENV)?.unwrap_or(defaults.default_limit);
        let max_limit = read_limit(&lookup, MAX_PAGE_LIMIT_ENV)?.unwrap_or(defaults.max_limit);
        Self::new(default_limit, max_limit)
    }
}

fn read_limit(
    lookup: &impl Fn(&str) -> Option<String>,
    variable: &'static str,
) -> Result<Option<PageLimit>, ConfigError> {
    let Some(raw) = lookup(variable) else {
        return Ok(None);
    };
    let value: u64 = raw.trim().parse().map_err(|_| ConfigError::NotANumber {
        variable,
        value: raw.clone(),
    })?;
    u32::try_from(value)
        .ok()
        .and_then(|value| PageLimit::try_new(value).ok())
        .map(Some)
        .ok_or(ConfigError::OutOfRange { variable, value })
}

/// A validated page request: `page >= 1` and `1 <= limit <= max_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: u32,
    limit: PageLimit,
}

impl PageRequest {
    /// Clamp raw caller input into a valid request.
    ///
    /// A page below 1 becomes 1. A limit of zero or less becomes the default;
    /// a limit above the maximum becomes the maximum.
    pub fn clamped(page: i64, limit: i64, config: &PaginationConfig) -> Self {
        let page = u32::try_from(page.max(1)).unwrap_or(u32::MAX);
        let max: u32 = config.max_limit.into_inner();
        let limit = if limit <= 0 {
            config.default_limit
        } else {
            let bounded = u32::try_from(limit).map_or(max, |limit| limit.min(max));
            PageLimit::try_new(bounded).unwrap_or(config.max_limit)
        };
        Self { page, limit }
    }

    /// One-based page number.
    pub const fn page(&self) -> u32 {
        self.page
    }

    /// Rows per page.
    pub fn limit(&self) -> u32 {
        self.limit.into_inner()
    }

    /// Rows to skip before this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit())
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::clamped(1, 0, &PaginationConfig::default())
    }
}
