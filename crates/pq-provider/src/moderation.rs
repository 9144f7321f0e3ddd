//! Prompt moderation gate.

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModerationResult {
    pub flagged: bool,
    /// Blocked terms found in the prompt, in configuration order.
    pub terms: Vec<String>,
}

impl ModerationResult {
    pub fn allowed() -> Self {
        Self::default()
    }

    pub fn flagged(terms: Vec<String>) -> Self {
        Self { flagged: !terms.is_empty(), terms }
    }
}

#[async_trait]
pub trait ModerationGate: Send + Sync {
    async fn check(&self, prompt: &str) -> ModerationResult;
}

/// Lets every prompt through.
#[derive(Debug, Default, Clone)]
pub struct NoopModerationGate;

#[async_trait]
impl ModerationGate for NoopModerationGate {
    async fn check(&self, _prompt: &str) -> ModerationResult {
        ModerationResult::allowed()
    }
}

/// Case-insensitive blocked-term matching on word boundaries.
///
/// Multi-word terms match a run of consecutive prompt words.
#[derive(Debug, Clone)]
pub struct KeywordModerationGate {
    terms: Vec<(String, Vec<String>)>,
}

impl KeywordModerationGate {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed: Vec<(String, Vec<String>)> = Vec::new();
        for term in terms {
            let words = words(term.as_ref());
            if words.is_empty() {
                continue;
            }
            let label = words.join(" ");
            if !parsed.iter().any(|(existing, _)| existing == &label) {
                parsed.push((label, words));
            }
        }
        Self { terms: parsed }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn scan(&self, prompt: &str) -> ModerationResult {
        let prompt_words = words(prompt);
        let hits = self
            .terms
            .iter()
            .filter(|(_, term_words)| {
                prompt_words
                    .windows(term_words.len())
                    .any(|window| window == term_words.as_slice())
            })
            .map(|(label, _)| label.clone())
            .collect();
        ModerationResult::flagged(hits)
    }
}

#[async_trait]
impl ModerationGate for KeywordModerationGate {
    async fn check(&self, prompt: &str) -> ModerationResult {
        self.scan(prompt)
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}
