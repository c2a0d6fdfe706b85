//! Label keys shared with the pipeline execution engine. The exact strings are part of the wire contract and
//! must not change.

pub const REPOSITORY: &str = "pipelinesascode.tekton.dev/repository";
pub const URL_REPOSITORY: &str = "pipelinesascode.tekton.dev/url-repository";
pub const SHA: &str = "pipelinesascode.tekton.dev/sha";
pub const PULL_REQUEST: &str = "pipelinesascode.tekton.dev/pull-request";
pub const ORIGINAL_PR_NAME: &str = "pipelinesascode.tekton.dev/original-prname";
pub const STATE: &str = "pipelinesascode.tekton.dev/state";
pub const EVENT_TYPE: &str = "pipelinesascode.tekton.dev/event-type";
pub const SENDER: &str = "pipelinesascode.tekton.dev/sender";

/// Kubernetes rejects label values longer than this.
const MAX_LABEL_VALUE_LENGTH: usize = 63;

/// Turns free text into something that is safe to use as a label value. The same transformation has to be
/// applied on both the writing and the matching side or selectors will silently miss.
pub fn clean_value(input: &str) -> String {
    let mut cleaned = String::with_capacity(input.len());

    for c in input.chars() {
        match c {
            '/' => cleaned.push('-'),
            ' ' => cleaned.push('_'),
            '[' | ']' => cleaned.push_str("__"),
            _ => cleaned.push(c),
        }
    }

    cleaned.chars().take(MAX_LABEL_VALUE_LENGTH).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("foo", "foo")]
    #[case("fooorg/foo", "fooorg-foo")]
    #[case("a name", "a_name")]
    #[case("bot[bot]", "bot__bot__")]
    fn cleans_label_values(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(clean_value(input), expected);
    }

    #[test]
    fn truncates_long_values() {
        let long = "a".repeat(100);
        assert_eq!(clean_value(&long).len(), MAX_LABEL_VALUE_LENGTH);
    }
}
