use std::fmt;

/// Anything that has a stable string representation usable inside a [`QueryKey`].
pub trait QueryKeyValue {
    /// The string form of this key.
    fn query_key_value(&self) -> String;
}

/// Identifies a cached value and its event channel.
///
/// Two keys are equal iff their strings are equal. Keys are never mutated; use
/// [`append`](Self::append) to derive namespaced sub-keys (per page, per parameter).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(String);

impl QueryKey {
    /// Creates a key from a string.
    pub fn new(value: impl Into<String>) -> Self {
        QueryKey(value.into())
    }

    /// The underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives `"<self>_<suffix>"`.
    pub fn append(&self, suffix: impl fmt::Display) -> QueryKey {
        QueryKey(format!("{}_{}", self.0, suffix))
    }

    /// Derives a key from another key-like value, e.g. a page cursor.
    pub fn append_key(&self, key: &impl QueryKeyValue) -> QueryKey {
        self.append(key.query_key_value())
    }
}

impl QueryKeyValue for QueryKey {
    fn query_key_value(&self) -> String {
        self.0.clone()
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        QueryKey::new(value)
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        QueryKey(value)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueryKey").field(&self.0).finish()
    }
}

/// A cursor that drives sequential page fetches.
pub trait PageKey: QueryKeyValue + Clone + fmt::Debug + 'static {
    /// The first page.
    fn first() -> Self;
    /// The page after this one.
    fn next(&self) -> Self;
}

/// Zero based page number. Saturates at `u32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NumericPage {
    /// Current page index.
    pub current: u32,
}

impl QueryKeyValue for NumericPage {
    fn query_key_value(&self) -> String {
        self.current.to_string()
    }
}

impl PageKey for NumericPage {
    fn first() -> Self {
        NumericPage { current: 0 }
    }

    fn next(&self) -> Self {
        NumericPage {
            current: self.current.saturating_add(1),
        }
    }
}

/// Limit/offset cursor with a fixed page size. The offset saturates at `u32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LimitOffsetPage<const LIMIT: u32> {
    /// Number of items skipped before this page.
    pub offset: u32,
}

impl<const LIMIT: u32> LimitOffsetPage<LIMIT> {
    /// Page size.
    pub const fn limit(&self) -> u32 {
        LIMIT
    }
}

impl<const LIMIT: u32> QueryKeyValue for LimitOffsetPage<LIMIT> {
    fn query_key_value(&self) -> String {
        format!("{}-{}", LIMIT, self.offset)
    }
}

impl<const LIMIT: u32> PageKey for LimitOffsetPage<LIMIT> {
    fn first() -> Self {
        LimitOffsetPage { offset: 0 }
    }

    fn next(&self) -> Self {
        LimitOffsetPage {
            offset: self.offset.saturating_add(LIMIT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_cursors_saturate_at_the_end_of_the_range() {
        let last = NumericPage { current: u32::MAX };
        assert_eq!(last.next(), last);

        let near_end = LimitOffsetPage::<10> {
            offset: u32::MAX - 3,
        };
        assert_eq!(near_end.next().offset, u32::MAX);
    }
    use std::collections::HashSet;

    #[test]
    fn append_derives_without_mutating() {
        let base = QueryKey::new("cards");
        let derived = base.append("en");
        assert_eq!(base.as_str(), "cards");
        assert_eq!(derived.as_str(), "cards_en");
        assert_eq!(derived.append(3).as_str(), "cards_en_3");
    }

    #[test]
    fn keys_hash_by_string() {
        let mut keys = HashSet::new();
        keys.insert(QueryKey::new("items_1"));
        assert!(keys.contains(&QueryKey::new("items").append(1)));
        assert!(!keys.contains(&QueryKey::new("items").append(2)));
    }

    #[test]
    fn numeric_pages_count_up_from_zero() {
        let first = NumericPage::first();
        assert_eq!(first.current, 0);
        assert_eq!(first.next().next().current, 2);
        assert_eq!(
            QueryKey::new("items").append_key(&first.next()).as_str(),
            "items_1"
        );
    }

    #[test]
    fn limit_offset_pages_step_by_limit() {
        let page = LimitOffsetPage::<25>::first().next();
        assert_eq!(page.offset, 25);
        assert_eq!(page.limit(), 25);
        assert_eq!(page.query_key_value(), "25-25");
    }
}
