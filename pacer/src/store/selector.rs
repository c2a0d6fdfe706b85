use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SelectorError {
    #[error("label selector requirement '{0}' has an empty key")]
    EmptyKey(String),

    #[error("label selector operator in '{0}' is not supported; only '=', '==' and key existence are")]
    UnsupportedOperator(String),
}

/// A single condition a record's labels must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Requirement {
    Equals { key: String, value: String },
    Exists { key: String },
}

impl Requirement {
    pub fn key(&self) -> &str {
        match self {
            Requirement::Equals { key, .. } => key,
            Requirement::Exists { key } => key,
        }
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals { key, value } => labels.get(key) == Some(value),
            Requirement::Exists { key } => labels.contains_key(key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals { key, value } => write!(f, "{key}={value}"),
            Requirement::Exists { key } => write!(f, "{key}"),
        }
    }
}

/// A conjunction of label requirements. An empty selector matches everything.
///
/// Stores are expected to answer selectors through an index rather than by scanning, but `matches` is the
/// reference semantics every engine must agree with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the label `key` to be exactly `value`.
    pub fn eq(mut self, key: &str, value: &str) -> Self {
        self.requirements.push(Requirement::Equals {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Require the label `key` to be present with any value.
    pub fn exists(mut self, key: &str) -> Self {
        self.requirements
            .push(Requirement::Exists { key: key.into() });
        self
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|requirement| requirement.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let requirements: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", requirements.join(","))
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut selector = LabelSelector::new();

        for raw in input.split(',').map(str::trim).filter(|raw| !raw.is_empty()) {
            if raw.contains("!=") || raw.contains(" in ") || raw.starts_with('!') {
                return Err(SelectorError::UnsupportedOperator(raw.into()));
            }

            let requirement = match raw.split_once("==").or_else(|| raw.split_once('=')) {
                Some((key, value)) => Requirement::Equals {
                    key: key.trim().into(),
                    value: value.trim().into(),
                },
                None => Requirement::Exists { key: raw.into() },
            };

            if requirement.key().is_empty() {
                return Err(SelectorError::EmptyKey(raw.into()));
            }

            selector.requirements.push(requirement);
        }

        Ok(selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn equality_requires_every_key() {
        let selector = LabelSelector::new().eq("sha", "foosha").eq("pull-request", "11");

        assert!(selector.matches(&labels(&[("sha", "foosha"), ("pull-request", "11")])));
        assert!(selector.matches(&labels(&[
            ("sha", "foosha"),
            ("pull-request", "11"),
            ("extra", "value")
        ])));
        assert!(!selector.matches(&labels(&[("sha", "foosha")])));
        assert!(!selector.matches(&labels(&[("sha", "foosha"), ("pull-request", "12")])));
    }

    #[test]
    fn existence_ignores_value() {
        let selector = LabelSelector::new().exists("state");

        assert!(selector.matches(&labels(&[("state", "")])));
        assert!(!selector.matches(&labels(&[("other", "x")])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        assert!(LabelSelector::new().matches(&BTreeMap::new()));
    }

    #[test]
    fn parses_and_prints_kubernetes_syntax() {
        let selector: LabelSelector = "sha=foosha, pull-request==11,state".parse().unwrap();

        assert_eq!(
            selector,
            LabelSelector::new()
                .eq("sha", "foosha")
                .eq("pull-request", "11")
                .exists("state")
        );
        assert_eq!(selector.to_string(), "sha=foosha,pull-request=11,state");
    }

    #[test]
    fn rejects_unsupported_operators() {
        assert_eq!(
            "sha!=foosha".parse::<LabelSelector>().unwrap_err(),
            SelectorError::UnsupportedOperator("sha!=foosha".into())
        );
        assert_eq!(
            "=foosha".parse::<LabelSelector>().unwrap_err(),
            SelectorError::EmptyKey("=foosha".into())
        );
    }
}
