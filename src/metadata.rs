//! Request and response metadata.

use bytes::Bytes;

/// An ordered multimap of metadata entries.
///
/// Names are normalised to lowercase on insertion, duplicates are allowed
/// and insertion order is preserved, matching how metadata travels on the
/// wire. Values are `Bytes` so binary-valued entries are representable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Bytes)>,
}

impl Metadata {
    /// Creates an empty metadata collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. The name is lowercased; existing entries with the
    /// same name are kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        let mut name = name.into();
        name.make_ascii_lowercase();
        self.entries.push((name, value.into()));
    }

    /// The first value for `name`, if any. Lookup is case-insensitive.
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Bytes> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// All entries, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N, V> FromIterator<(N, V)> for Metadata
where
    N: Into<String>,
    V: Into<Bytes>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (name, value) in iter {
            metadata.insert(name, value);
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_lowercased() {
        let mut metadata = Metadata::new();
        metadata.insert("X-Request-Id", "abc");
        assert_eq!(metadata.get("x-request-id"), Some(&Bytes::from("abc")));
        assert_eq!(metadata.get("X-REQUEST-ID"), Some(&Bytes::from("abc")));
    }

    #[test]
    fn duplicates_preserve_order() {
        let metadata: Metadata = [("k", "1"), ("k", "2"), ("other", "x")]
            .into_iter()
            .collect();
        let values: Vec<_> = metadata.get_all("k").cloned().collect();
        assert_eq!(values, vec![Bytes::from("1"), Bytes::from("2")]);
        assert_eq!(metadata.len(), 3);
    }

    #[test]
    fn missing_name() {
        let metadata = Metadata::new();
        assert!(metadata.get("absent").is_none());
        assert!(metadata.is_empty());
    }
}
