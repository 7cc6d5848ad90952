use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Grouping descriptor for buffered events.
///
/// Events sharing a metadata value accumulate into the same staged chunk.
/// Each field is independently optional; two metadatas are equal iff all
/// three fields are equal. The buffer interns metadata values so equal
/// descriptors share one canonical `Arc<Metadata>` instance, and the `Ord`
/// impl gives writers a stable order in which to lock chunks of different
/// metadatas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Metadata {
    /// Start of the time window this group covers (unix seconds).
    pub timekey: Option<i64>,
    /// Event routing tag.
    pub tag: Option<String>,
    /// User-defined grouping variables.
    pub variables: Option<BTreeMap<String, String>>,
}

impl Metadata {
    pub fn new(
        timekey: Option<i64>,
        tag: Option<String>,
        variables: Option<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            timekey,
            tag,
            variables,
        }
    }

    /// Metadata with every field unset, used by callers that do not group.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn equality_is_over_the_whole_triple() {
        let a = Metadata::new(Some(60), Some("app.log".into()), None);
        let b = Metadata::new(Some(60), Some("app.log".into()), None);
        let c = Metadata::new(Some(120), Some("app.log".into()), None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(
            Metadata::new(None, None, Some(vars(&[("k", "v")]))),
            Metadata::new(None, None, Some(vars(&[("k", "w")]))),
        );
    }

    #[test]
    fn ordering_is_total_and_stable() {
        let mut list = vec![
            Metadata::new(Some(120), None, None),
            Metadata::new(None, Some("b".into()), None),
            Metadata::new(Some(60), None, None),
            Metadata::empty(),
        ];
        list.sort();
        assert_eq!(list[0], Metadata::empty());
        assert_eq!(list[1], Metadata::new(Some(60), None, None));
    }
}
