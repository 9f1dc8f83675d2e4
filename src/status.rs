//! Ordered status snapshots for operational endpoints.

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Per-name status entries in registry insertion order.
///
/// Serializes as a JSON object whose keys keep that order.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport<T> {
    entries: Vec<(String, T)>,
}

impl<T> StatusReport<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, status: T) {
        self.entries.push((name.into(), status));
    }

    /// Look up the status for a name.
    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, status)| status)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries
            .iter()
            .map(|(name, status)| (name.as_str(), status))
    }
}

impl<T> Default for StatusReport<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<(String, T)> for StatusReport<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<T> IntoIterator for StatusReport<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<T: Serialize> Serialize for StatusReport<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, status) in &self.entries {
            map.serialize_entry(name, status)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_in_insertion_order() {
        let mut report = StatusReport::new();
        report.push("zeta", 1);
        report.push("alpha", 2);

        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(json, r#"{"zeta":1,"alpha":2}"#);
    }

    #[test]
    fn test_lookup_by_name() {
        let report: StatusReport<u32> =
            vec![("a".to_string(), 1), ("b".to_string(), 2)].into_iter().collect();

        assert_eq!(report.get("b"), Some(&2));
        assert_eq!(report.get("c"), None);
        assert_eq!(report.len(), 2);
        assert_eq!(report.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
