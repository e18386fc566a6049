//! Destinations and tag filters.
//!
//! A destination is written `topic` or `topic:tag`. The string is split on the
//! first colon; whatever follows is the tag, and it must not be empty. A tag is
//! either a value or absent, never an empty string.

use std::collections::BTreeSet;
use std::fmt;

use crate::utils::{MqError, Result};

/// Longest accepted topic name.
pub const MAX_TOPIC_LEN: usize = 127;

/// A validated `topic[:tag]` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub topic: String,
    pub tag: Option<String>,
}

impl Destination {
    pub fn parse(destination: &str) -> Result<Self> {
        let (topic, tag) = match destination.split_once(':') {
            Some((topic, tag)) => (topic, Some(tag)),
            None => (destination, None),
        };

        validate_topic(topic)?;
        if let Some(tag) = tag {
            validate_tag(tag)?;
        }

        Ok(Self {
            topic: topic.to_string(),
            tag: tag.map(str::to_string),
        })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}:{}", self.topic, tag),
            None => f.write_str(&self.topic),
        }
    }
}

pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(MqError::validation("topic must not be empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(MqError::validation(format!(
            "topic '{topic}' is longer than {MAX_TOPIC_LEN} characters"
        )));
    }
    if !topic
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '%' | '|'))
    {
        return Err(MqError::validation(format!(
            "topic '{topic}' contains illegal characters"
        )));
    }
    Ok(())
}

pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.trim().is_empty() {
        return Err(MqError::validation("tag must be absent or non-empty"));
    }
    Ok(())
}

/// Which tags a subscription accepts.
///
/// Parsed from `*` (everything), `tag` or `tag1 || tag2`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TagFilter {
    #[default]
    All,
    AnyOf(BTreeSet<String>),
}

impl TagFilter {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        if expression.is_empty() || expression == "*" {
            return Ok(Self::All);
        }

        let mut tags = BTreeSet::new();
        for tag in expression.split("||") {
            let tag = tag.trim();
            validate_tag(tag)?;
            tags.insert(tag.to_string());
        }
        Ok(Self::AnyOf(tags))
    }

    /// Exact match against the message tag. An untagged message only passes `All`.
    pub fn matches(&self, tag: Option<&str>) -> bool {
        match self {
            Self::All => true,
            Self::AnyOf(tags) => tag.is_some_and(|t| tags.contains(t)),
        }
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::AnyOf(tags) => {
                let joined: Vec<&str> = tags.iter().map(String::as_str).collect();
                f.write_str(&joined.join(" || "))
            }
        }
    }
}
