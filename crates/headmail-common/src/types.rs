//! Shared types for Headmail

use serde::{Deserialize, Serialize};

/// Tracing header stamped on every outbound message. The bounce ingester
/// reads it back from the returned original to resolve the delivery.
pub const DELIVERY_HEADER: &str = "X-Headmail-Delivery";

/// Request-side pagination, `?page=1&limit=20`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl Pagination {
    pub fn offset(&self) -> i64 {
        (self.page.max(1) as i64 - 1) * self.limit as i64
    }

    pub fn limit(&self) -> i64 {
        self.limit as i64
    }
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

/// Pagination echo included in list responses.
#[derive(Debug, Clone, Serialize)]
pub struct PageInfo {
    pub page: u32,
    pub total: i64,
    pub limit: u32,
}

impl PageInfo {
    pub fn new(pagination: Pagination, total: i64) -> Self {
        Self {
            page: pagination.page,
            total,
            limit: pagination.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_offset() {
        let p = Pagination { page: 1, limit: 20 };
        assert_eq!(p.offset(), 0);
        let p = Pagination { page: 3, limit: 50 };
        assert_eq!(p.offset(), 100);
        // page 0 is clamped to the first page
        let p = Pagination { page: 0, limit: 20 };
        assert_eq!(p.offset(), 0);
    }
}
