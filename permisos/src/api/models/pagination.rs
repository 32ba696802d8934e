//! Offset pagination for list endpoints: `?skip=40&limit=20`.

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use utoipa::{IntoParams, ToSchema};

/// Page size when the request does not give one. One screen of the staff review queue.
pub const DEFAULT_PAGE_SIZE: i64 = 20;

pub const MAX_PAGE_SIZE: i64 = 100;

/// Raw `skip`/`limit` query parameters.
///
/// Flattened into the list query structs, where serde only sees strings, hence `DisplayFromStr`.
#[serde_as]
#[derive(Debug, Default, Clone, Copy, Deserialize, IntoParams, ToSchema)]
pub struct Pagination {
    #[param(default = 0, minimum = 0)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub skip: Option<i64>,

    #[param(default = 20, minimum = 1, maximum = 100)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub limit: Option<i64>,
}

/// Offset and size after clamping; what the repositories get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: i64,
    pub limit: i64,
}

impl Pagination {
    /// Negative offsets start at the beginning; sizes are kept within `1..=MAX_PAGE_SIZE`.
    pub fn page(&self) -> Page {
        Page {
            skip: self.skip.unwrap_or(0).max(0),
            limit: self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }
}

/// One page of a list plus what a client needs to fetch the next.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaginatedResponse<T: ToSchema> {
    pub data: Vec<T>,
    /// Rows matching the filters, across all pages
    pub total_count: i64,
    pub skip: i64,
    pub limit: i64,
    /// Rows remain past this page
    pub has_more: bool,
}

impl<T: ToSchema> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total_count: i64, page: Page) -> Self {
        let has_more = page.skip + (data.len() as i64) < total_count;
        Self {
            data,
            total_count,
            skip: page.skip,
            limit: page.limit,
            has_more,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_clamping() {
        let cases = [
            (None, None, 0, DEFAULT_PAGE_SIZE),
            (Some(-3), Some(0), 0, 1),
            (Some(40), Some(-5), 40, 1),
            (Some(40), Some(500), 40, MAX_PAGE_SIZE),
            (Some(20), Some(50), 20, 50),
        ];
        for (skip, limit, expected_skip, expected_limit) in cases {
            let page = Pagination { skip, limit }.page();
            assert_eq!(page, Page {
                skip: expected_skip,
                limit: expected_limit,
            }, "skip={skip:?} limit={limit:?}");
        }
    }

    #[test]
    fn test_query_strings_parse() {
        let pagination: Pagination = serde_json::from_value(serde_json::json!({ "skip": "10", "limit": "5" })).unwrap();
        assert_eq!(pagination.page(), Page { skip: 10, limit: 5 });
    }

    #[test]
    fn test_has_more() {
        let page = Page { skip: 20, limit: 20 };
        let middle = PaginatedResponse::new(vec![0u8; 20], 45, page);
        assert!(middle.has_more);

        let last = PaginatedResponse::new(vec![0u8; 5], 45, Page { skip: 40, limit: 20 });
        assert!(!last.has_more);

        let empty = PaginatedResponse::<u8>::new(Vec::new(), 0, Page { skip: 0, limit: 20 });
        assert!(!empty.has_more);
    }
}
