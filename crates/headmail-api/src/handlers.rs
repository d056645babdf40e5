//! Request handlers

pub mod campaigns;
pub mod deliveries;
pub mod health;
pub mod lists;
pub mod subscribers;
pub mod templates;
pub mod tracking;

use headmail_common::types::{PageInfo, Pagination};
use serde::Serialize;

/// Paginated list response: `data[]` plus the pagination echo.
#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub pagination: PageInfo,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, pagination: Pagination, total: i64) -> Self {
        Self {
            data,
            pagination: PageInfo::new(pagination, total),
        }
    }
}

/// Standard delete acknowledgement.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
    pub message: String,
}

impl DeleteResponse {
    pub fn new(message: &str) -> Self {
        Self {
            deleted: true,
            message: message.to_string(),
        }
    }
}
