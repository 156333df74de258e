//! Embedding text composition.

use serde::{Deserialize, Serialize};

use crate::types::CanonicalRecord;

/// Which record fields feed the embedding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMode {
    /// Question and answer joined by the delimiter
    #[default]
    QuestionAnswer,
    /// Question only; records with an empty question are skipped
    QuestionOnly,
}

impl std::str::FromStr for TextMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "question_answer" => Ok(Self::QuestionAnswer),
            "question_only" => Ok(Self::QuestionOnly),
            other => Err(format!("unknown text mode: {other}")),
        }
    }
}

/// Derives the text to embed from a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextComposer {
    mode: TextMode,
    delimiter: String,
}

impl Default for TextComposer {
    fn default() -> Self {
        Self::new(TextMode::QuestionAnswer, "\n")
    }
}

impl TextComposer {
    pub fn new(mode: TextMode, delimiter: impl Into<String>) -> Self {
        Self {
            mode,
            delimiter: delimiter.into(),
        }
    }

    pub fn mode(&self) -> TextMode {
        self.mode
    }

    /// Text to embed, or `None` if the record has nothing to embed.
    ///
    /// Fields are trimmed first; the delimiter only appears when both sides
    /// are non-empty.
    pub fn compose(&self, record: &CanonicalRecord) -> Option<String> {
        let question = record.question.trim();
        let answer = record.answer.trim();

        match self.mode {
            TextMode::QuestionOnly if question.is_empty() => None,
            TextMode::QuestionOnly => Some(question.to_string()),
            TextMode::QuestionAnswer => match (question.is_empty(), answer.is_empty()) {
                (true, true) => None,
                (false, true) => Some(question.to_string()),
                (true, false) => Some(answer.to_string()),
                (false, false) => Some(format!("{question}{}{answer}", self.delimiter)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(question: &str, answer: &str) -> CanonicalRecord {
        CanonicalRecord {
            id: "A1".to_string(),
            asin: "B00".to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
        }
    }

    #[test]
    fn test_compose_both_fields() {
        let composer = TextComposer::default();
        let text = composer
            .compose(&record("Is Windows 8 good for gaming?", "Yes, with a discrete GPU."))
            .unwrap();
        assert_eq!(text, "Is Windows 8 good for gaming?\nYes, with a discrete GPU.");
    }

    #[test]
    fn test_compose_single_field_has_no_delimiter() {
        let composer = TextComposer::new(TextMode::QuestionAnswer, " | ");
        assert_eq!(composer.compose(&record("q", "")).unwrap(), "q");
        assert_eq!(composer.compose(&record("  ", "a ")).unwrap(), "a");
    }

    #[test]
    fn test_compose_empty_record_is_none() {
        let composer = TextComposer::default();
        assert!(composer.compose(&record("", "")).is_none());
        assert!(composer.compose(&record("   ", "\n")).is_none());
    }

    #[test]
    fn test_compose_question_only() {
        let composer = TextComposer::new(TextMode::QuestionOnly, "\n");
        assert_eq!(composer.compose(&record("q", "a")).unwrap(), "q");
        assert!(composer.compose(&record("", "a")).is_none());
    }

    #[test]
    fn test_compose_is_deterministic() {
        let composer = TextComposer::default();
        let r = record("Does this laptop support Linux?", "No.");
        assert_eq!(composer.compose(&r), composer.compose(&r));
    }

    #[test]
    fn test_text_mode_parse() {
        assert_eq!("question_only".parse::<TextMode>().unwrap(), TextMode::QuestionOnly);
        assert_eq!(
            "question_answer".parse::<TextMode>().unwrap(),
            TextMode::QuestionAnswer
        );
        assert!("answers".parse::<TextMode>().is_err());
    }

    #[test]
    fn test_text_mode_serde() {
        assert_eq!(
            serde_json::to_string(&TextMode::QuestionOnly).unwrap(),
            "\"question_only\""
        );
    }
}
