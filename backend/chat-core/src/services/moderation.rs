use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Moderation outcome for a piece of user text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub approved: bool,
    /// Replacement text to store instead of the original, if any
    pub cleaned_text: Option<String>,
    pub flags: Vec<String>,
}

impl ModerationVerdict {
    pub fn approved() -> Self {
        Self {
            approved: true,
            cleaned_text: None,
            flags: Vec::new(),
        }
    }

    pub fn cleaned(text: String, flags: Vec<String>) -> Self {
        Self {
            approved: true,
            cleaned_text: Some(text),
            flags,
        }
    }

    pub fn rejected(flags: Vec<String>) -> Self {
        Self {
            approved: false,
            cleaned_text: None,
            flags,
        }
    }
}

/// External content moderation service
#[async_trait]
pub trait ModerationGateway: Send + Sync {
    async fn moderate(&self, text: &str, author_id: Uuid) -> AppResult<ModerationVerdict>;
}

/// Approves everything unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllModerator;

#[async_trait]
impl ModerationGateway for AllowAllModerator {
    async fn moderate(&self, _text: &str, _author_id: Uuid) -> AppResult<ModerationVerdict> {
        Ok(ModerationVerdict::approved())
    }
}

/// Word-list moderator: blocked words reject the message, masked words are
/// replaced with asterisks.
#[derive(Debug, Clone, Default)]
pub struct KeywordModerator {
    blocked: HashSet<String>,
    masked: HashSet<String>,
}

impl KeywordModerator {
    pub fn new<B, M, S>(blocked: B, masked: M) -> Self
    where
        B: IntoIterator<Item = S>,
        M: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            blocked: blocked
                .into_iter()
                .map(|w| w.as_ref().to_lowercase())
                .collect(),
            masked: masked
                .into_iter()
                .map(|w| w.as_ref().to_lowercase())
                .collect(),
        }
    }

    fn normalize(word: &str) -> String {
        word.trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase()
    }

    /// Check text for violations
    pub fn check(&self, text: &str) -> ModerationVerdict {
        if text.is_empty() {
            return ModerationVerdict::approved();
        }

        let mut flags = Vec::new();
        for word in words(text).map(Self::normalize) {
            if self.blocked.contains(&word) {
                let flag = format!("blocked_word: {}", word);
                if !flags.contains(&flag) {
                    tracing::debug!("Flagged for blocked word: {}", word);
                    flags.push(flag);
                }
            }
        }
        if !flags.is_empty() {
            return ModerationVerdict::rejected(flags);
        }

        let mut masked_any = false;
        let mut cleaned = String::with_capacity(text.len());
        for (token, is_word) in tokens(text) {
            if is_word && self.masked.contains(&Self::normalize(token)) {
                masked_any = true;
                cleaned.extend(std::iter::repeat('*').take(token.chars().count()));
            } else {
                cleaned.push_str(token);
            }
        }

        if masked_any {
            ModerationVerdict::cleaned(cleaned, vec!["masked_words".to_string()])
        } else {
            ModerationVerdict::approved()
        }
    }
}

/// Split into alternating runs of non-whitespace (`true`) and whitespace
/// (`false`). Concatenating the tokens yields the input unchanged.
fn tokens(text: &str) -> impl Iterator<Item = (&str, bool)> {
    let mut rest = text;
    std::iter::from_fn(move || {
        let first = rest.chars().next()?;
        let is_word = !first.is_whitespace();
        let end = rest
            .char_indices()
            .find(|(_, c)| c.is_whitespace() == is_word)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (token, tail) = rest.split_at(end);
        rest = tail;
        Some((token, is_word))
    })
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    tokens(text).filter(|(_, is_word)| *is_word).map(|(token, _)| token)
}

#[async_trait]
impl ModerationGateway for KeywordModerator {
    async fn moderate(&self, text: &str, _author_id: Uuid) -> AppResult<ModerationVerdict> {
        Ok(self.check(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moderator() -> KeywordModerator {
        KeywordModerator::new(["scam"], ["darn"])
    }

    #[test]
    fn test_clean_text_is_approved_unchanged() {
        assert_eq!(moderator().check("hello there"), ModerationVerdict::approved());
    }

    #[test]
    fn test_blocked_word_rejects_case_insensitively() {
        let verdict = moderator().check("this is a SCAM!");
        assert!(!verdict.approved);
        assert_eq!(verdict.flags, vec!["blocked_word: scam".to_string()]);
    }

    #[test]
    fn test_masked_word_is_replaced() {
        let verdict = moderator().check("well darn it");
        assert!(verdict.approved);
        assert_eq!(verdict.cleaned_text.as_deref(), Some("well **** it"));
    }

    #[test]
    fn test_masking_keeps_every_separator() {
        let verdict = moderator().check("well\ndarn\tit  DARN.");
        assert!(verdict.approved);
        assert_eq!(verdict.flags, vec!["masked_words".to_string()]);
        assert_eq!(verdict.cleaned_text.as_deref(), Some("well\n****\tit  *****"));
    }

    #[test]
    fn test_blocked_word_after_newline_is_found() {
        let verdict = moderator().check("hey\nscam");
        assert!(!verdict.approved);
    }

    #[test]
    fn test_tokens_reassemble_input() {
        let text = " a\tb \n c ";
        let joined: String = tokens(text).map(|(t, _)| t).collect();
        assert_eq!(joined, text);
        assert_eq!(words(text).collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }
}
