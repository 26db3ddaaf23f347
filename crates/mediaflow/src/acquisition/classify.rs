//! Classification of acquisition tool errors
//!
//! Rules are checked in order; the first whose keyword group is fully contained in the
//! lowercased message wins. Anything unmatched is [`FailureKind::Other`].

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::FailureKind;

static ERROR_DETAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[[a-z:]+\] [A-Za-z0-9_-]{11}: (.*)").expect("valid error detail pattern")
});

static RESOURCE_ID_IN_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:youtube\.com/(?:[^/\n\s]+/\S+/|(?:v|e(?:mbed)?)/|\S*?[?&]v=)|youtu\.be/)([a-zA-Z0-9_-]{11})",
    )
    .expect("valid resource url pattern")
});

static BARE_RESOURCE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid resource id pattern"));

/// One classification rule: matches when any keyword group is fully present
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub kind: FailureKind,
    pub any_of: Vec<Vec<String>>,
}

impl ClassificationRule {
    pub fn new(kind: FailureKind, any_of: &[&[&str]]) -> Self {
        Self {
            kind,
            any_of: any_of
                .iter()
                .map(|group| group.iter().map(|k| k.to_lowercase()).collect())
                .collect(),
        }
    }

    fn matches(&self, lowered: &str) -> bool {
        self.any_of
            .iter()
            .any(|group| group.iter().all(|keyword| lowered.contains(keyword.as_str())))
    }
}

/// Prioritized rule list
#[derive(Debug, Clone)]
pub struct ClassificationRules {
    rules: Vec<ClassificationRule>,
}

impl ClassificationRules {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// Category of an error message
    pub fn classify(&self, message: &str) -> FailureKind {
        let lowered = message.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lowered))
            .map(|rule| rule.kind)
            .unwrap_or(FailureKind::Other)
    }
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self::new(vec![
            ClassificationRule::new(FailureKind::AgeRestricted, &[&["age", "sign in"]]),
            ClassificationRule::new(
                FailureKind::Bot,
                &[&["bot", "sign in"], &["403", "forbidden"]],
            ),
            ClassificationRule::new(
                FailureKind::NoSuitableFormat,
                &[&["requested format is not available"]],
            ),
        ])
    }
}

/// Tool message with its `[extractor] <id>: ` prefix stripped
pub fn extract_error_detail(message: &str) -> String {
    ERROR_DETAIL
        .captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| message.trim().to_string())
}

/// Resource id from a watch/share/embed url, or a bare id
pub fn extract_resource_id(input: &str) -> Option<String> {
    let input = input.trim();
    if BARE_RESOURCE_ID.is_match(input) {
        return Some(input.to_string());
    }
    RESOURCE_ID_IN_URL
        .captures(input)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
