//! Metric name transforms.

use plumb_metric::Metric;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Renames metrics.
///
/// An override replaces the name outright and suppresses prefix and suffix.
/// Without one, the prefix is prepended and the suffix appended.
pub struct Rename {
    name_override: Option<String>,
    name_prefix: Option<String>,
    name_suffix: Option<String>,
}

impl Rename {
    /// Create a rename. Empty strings count as absent.
    #[must_use]
    pub fn new(
        name_override: Option<String>,
        name_prefix: Option<String>,
        name_suffix: Option<String>,
    ) -> Self {
        let present = |s: Option<String>| s.filter(|s| !s.is_empty());
        Self {
            name_override: present(name_override),
            name_prefix: present(name_prefix),
            name_suffix: present(name_suffix),
        }
    }

    /// Rename `metric` in place.
    pub fn apply(&self, metric: &mut Metric) {
        if let Some(name) = &self.name_override {
            metric.set_name(name.clone());
            return;
        }
        if let Some(prefix) = &self.name_prefix {
            metric.add_prefix(prefix);
        }
        if let Some(suffix) = &self.name_suffix {
            metric.add_suffix(suffix);
        }
    }
}

#[cfg(test)]
mod tests {
    use plumb_metric::Timestamp;

    use super::*;

    fn renamed(rename: &Rename) -> String {
        let mut metric = Metric::new("m", [("v", 1)], Timestamp::EPOCH).expect("valid metric");
        rename.apply(&mut metric);
        metric.name().to_string()
    }

    fn some(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn prefix_and_suffix_compose() {
        let rename = Rename::new(None, some("pre_"), some("_suf"));
        assert_eq!(renamed(&rename), "pre_m_suf");
    }

    #[test]
    fn override_wins_over_prefix_and_suffix() {
        let rename = Rename::new(some("X"), some("pre_"), some("_suf"));
        assert_eq!(renamed(&rename), "X");
    }

    #[test]
    fn empty_strings_are_absent() {
        let rename = Rename::new(some(""), some(""), None);
        assert_eq!(rename, Rename::default());
        assert_eq!(renamed(&rename), "m");
    }
}
