//! Environment-namespaced queue names.
//!
//! A queue `image-generation` under prefix `pixelq` in `production` is
//! stored as `pixelq:image-generation-production`, with auxiliary keys
//! `...:meta`, `...:events` and `...:metrics` next to it. The environment
//! may not contain `-`, so the last `-` always separates it from the queue.

use crate::{QueueError, Result};

const AUX_SUFFIXES: &[&str] = &[":meta", ":events", ":metrics"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    prefix: String,
    environment: String,
}

impl QueueNames {
    pub fn new(prefix: impl Into<String>, environment: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        let environment = environment.into();
        if prefix.is_empty() || prefix.contains(':') {
            return Err(QueueError::InvalidName(format!("prefix '{}' must be non-empty without ':'", prefix)));
        }
        if environment.is_empty() || environment.contains([':', '-']) {
            return Err(QueueError::InvalidName(format!(
                "environment '{}' must be non-empty without ':' or '-'",
                environment
            )));
        }
        Ok(Self { prefix, environment })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// `<prefix>:<queue>-<env>`
    pub fn queue_name(&self, queue: &str) -> String {
        format!("{}:{}-{}", self.prefix, queue, self.environment)
    }

    pub fn metadata_key(&self, queue: &str) -> String {
        format!("{}:meta", self.queue_name(queue))
    }

    pub fn events_key(&self, queue: &str) -> String {
        format!("{}:events", self.queue_name(queue))
    }

    pub fn metrics_key(&self, queue: &str) -> String {
        format!("{}:metrics", self.queue_name(queue))
    }
}

/// Inverse of [`QueueNames::queue_name`]: recover the bare queue name from a
/// namespaced name or auxiliary key.
///
/// Input without a prefix separator is returned unchanged.
pub fn display_name(full_name: &str) -> String {
    let Some((_, rest)) = full_name.split_once(':') else {
        return full_name.to_string();
    };
    let rest = AUX_SUFFIXES
        .iter()
        .find_map(|suffix| rest.strip_suffix(suffix))
        .unwrap_or(rest);
    match rest.rsplit_once('-') {
        Some((queue, _env)) if !queue.is_empty() => queue.to_string(),
        _ => rest.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_format() {
        let names = QueueNames::new("pixelq", "production").unwrap();
        assert_eq!(names.queue_name("image-generation"), "pixelq:image-generation-production");
        assert_eq!(names.metadata_key("render"), "pixelq:render-production:meta");
        assert_eq!(names.events_key("render"), "pixelq:render-production:events");
        assert_eq!(names.metrics_key("render"), "pixelq:render-production:metrics");
    }

    #[test]
    fn test_display_name_inverts_queue_name() {
        let names = QueueNames::new("pixelq", "staging").unwrap();
        for queue in ["render", "image-generation", "notification"] {
            assert_eq!(display_name(&names.queue_name(queue)), queue);
            assert_eq!(display_name(&names.events_key(queue)), queue);
        }
    }

    #[test]
    fn test_environment_with_dash_is_rejected() {
        assert!(matches!(QueueNames::new("pixelq", "us-east"), Err(QueueError::InvalidName(_))));
        assert!(matches!(QueueNames::new("pixelq", "eu:prod"), Err(QueueError::InvalidName(_))));
        assert!(matches!(QueueNames::new("pix:elq", "prod"), Err(QueueError::InvalidName(_))));

        let names = QueueNames::new("pixelq", "us_east").unwrap();
        assert_eq!(display_name(&names.queue_name("image-generation")), "image-generation");
    }

    #[test]
    fn test_display_name_passthrough() {
        assert_eq!(display_name("plain"), "plain");
        assert_eq!(display_name("pixelq:noenv"), "noenv");
    }
}
