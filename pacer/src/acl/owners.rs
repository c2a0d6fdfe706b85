use serde::Deserialize;
use serde_yaml::Value;

/// The parsed contents of an OWNERS file.
///
/// ```yaml
/// approvers:
///   - alice
/// reviewers:
///   - bob
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Owners {
    pub approvers: Vec<String>,
    pub reviewers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawOwners {
    #[serde(default)]
    approvers: Option<Vec<Value>>,
    #[serde(default)]
    reviewers: Option<Vec<Value>>,
}

/// Entries are usually strings, but a purely numeric handle comes out of YAML as a number.
fn entries(values: Option<Vec<Value>>) -> Vec<String> {
    values
        .unwrap_or_default()
        .into_iter()
        .filter_map(|value| match value {
            Value::String(entry) => Some(entry.trim().to_string()),
            Value::Number(entry) => Some(entry.to_string()),
            _ => None,
        })
        .filter(|entry| !entry.is_empty())
        .collect()
}

impl Owners {
    pub fn parse(content: &[u8]) -> Result<Self, serde_yaml::Error> {
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let raw: Option<RawOwners> = serde_yaml::from_slice(content)?;
        let raw = raw.unwrap_or_default();

        Ok(Self {
            approvers: entries(raw.approvers),
            reviewers: entries(raw.reviewers),
        })
    }

    pub fn contains(&self, login: &str) -> bool {
        let login = login.trim();
        if login.is_empty() {
            return false;
        }

        self.approvers
            .iter()
            .chain(self.reviewers.iter())
            .any(|entry| entry == login)
    }
}
