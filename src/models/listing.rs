//! One page of a bucket listing.

/// Keys returned by a single backend listing call.
///
/// Pages are ephemeral: the listing enumerator consumes them to drive
/// pagination and never keeps more than one around.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListingPage {
    /// Keys in lexicographic order.
    pub entries: Vec<String>,

    /// Cursor for the next page; `None` on the last page.
    pub continuation_token: Option<String>,
}

impl ListingPage {
    pub fn last(entries: Vec<String>) -> Self {
        Self {
            entries,
            continuation_token: None,
        }
    }
}
