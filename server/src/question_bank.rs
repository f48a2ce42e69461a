//! Read-only question and theme storage: the data file loader, filtered
//! random selection for new sessions, answer checking and scoring.

use crate::text;
use log::{info, warn};
use rand::seq::SliceRandom;
use shared::{AnswerValue, Difficulty, QuestionKind};
use std::path::Path;

/// A question category. Theme ids are dense and assigned in the order the
/// names are first seen while loading the data file.
#[derive(Debug, Clone)]
pub struct Theme {
    pub id: u32,
    pub name: String,
}

/// Kind-specific payload of a question. Exactly one correctness field exists
/// per kind, by construction.
#[derive(Debug, Clone)]
pub enum QuestionBody {
    MultiChoice {
        /// The four options, in display order
        options: [String; 4],
        /// Index of the correct option
        correct: usize,
    },
    Boolean {
        correct: bool,
    },
    Text {
        /// Accepted answers, compared accent- and case-insensitively
        accepted: Vec<String>,
    },
}

/// An immutable quiz question
#[derive(Debug, Clone)]
pub struct Question {
    pub id: u32,
    pub theme_ids: Vec<u32>,
    pub difficulty: Difficulty,
    pub prompt: String,
    pub body: QuestionBody,
    pub explanation: Option<String>,
}

impl Question {
    pub fn kind(&self) -> QuestionKind {
        match self.body {
            QuestionBody::MultiChoice { .. } => QuestionKind::MultiChoice,
            QuestionBody::Boolean { .. } => QuestionKind::Boolean,
            QuestionBody::Text { .. } => QuestionKind::Text,
        }
    }

    /// Checks a submitted answer against this question.
    pub fn check_answer(&self, answer: &AnswerValue) -> bool {
        match (&self.body, answer) {
            (QuestionBody::MultiChoice { correct, .. }, AnswerValue::Choice(idx)) => {
                *idx == *correct as i64
            }
            (QuestionBody::Boolean { correct }, AnswerValue::Flag(flag)) => flag == correct,
            (QuestionBody::Text { accepted }, AnswerValue::Text(given)) => {
                accepted.iter().any(|a| text::answers_match(a, given))
            }
            _ => false,
        }
    }

    /// The value reported as `correctAnswer` in results: the option index
    /// for multi-choice, 0/1 for boolean, the first accepted answer for text.
    pub fn correct_answer_value(&self) -> serde_json::Value {
        match &self.body {
            QuestionBody::MultiChoice { correct, .. } => serde_json::json!(correct),
            QuestionBody::Boolean { correct } => serde_json::json!(*correct as i64),
            QuestionBody::Text { accepted } => {
                serde_json::json!(accepted.first().cloned().unwrap_or_default())
            }
        }
    }
}

/// Base and speed-bonus points for a difficulty level
fn points_table(difficulty: Difficulty) -> (i64, i64) {
    match difficulty {
        Difficulty::Easy => (5, 1),
        Difficulty::Medium => (10, 3),
        Difficulty::Hard => (15, 6),
    }
}

/// Points awarded for a correct answer: base points by difficulty, plus a
/// speed bonus when the answer came within the first half of the time limit.
pub fn points_for(difficulty: Difficulty, response_time: f64, time_limit: u32) -> i64 {
    let (base, bonus) = points_table(difficulty);
    if response_time <= time_limit as f64 / 2.0 {
        base + bonus
    } else {
        base
    }
}

/// Failure of [`QuestionBank::select`]: fewer matching questions than asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsufficientQuestions {
    pub available: usize,
    pub requested: usize,
}

/// The loaded question database. Immutable after load.
pub struct QuestionBank {
    themes: Vec<Theme>,
    questions: Vec<Question>,
}

impl QuestionBank {
    /// Loads the question data file.
    ///
    /// One record per line:
    /// `themes;difficulty;type;question;answers;correct;explanation` where
    /// `themes` and `answers` are comma-separated. Blank lines and `#`
    /// comments are skipped; malformed lines are skipped with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot open questions file '{}': {}", path.display(), e))?;

        let mut bank = Self {
            themes: Vec::new(),
            questions: Vec::new(),
        };
        let mut next_id = 1;

        for (line_num, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match bank.parse_record(line, next_id) {
                Some(question) => {
                    bank.questions.push(question);
                    next_id += 1;
                }
                None => warn!("Skipping malformed question on line {}", line_num + 1),
            }
        }

        info!(
            "Loaded {} question(s), {} theme(s) from {}",
            bank.questions.len(),
            bank.themes.len(),
            path.display()
        );
        Ok(bank)
    }

    /// Builds a bank directly from parts. Used by tests and by embedders
    /// that load questions through other means.
    pub fn from_parts(themes: Vec<Theme>, questions: Vec<Question>) -> Self {
        Self { themes, questions }
    }

    fn parse_record(&mut self, line: &str, id: u32) -> Option<Question> {
        let mut fields = line.split(';');

        let themes_field = fields.next()?;
        let difficulty = Difficulty::parse(fields.next()?);
        let kind = fields.next()?.trim();
        let prompt = fields.next()?.trim();
        let answers_field = fields.next()?;
        let correct_field = fields.next()?.trim();
        let explanation = fields
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);

        if prompt.is_empty() {
            return None;
        }

        let theme_ids: Vec<u32> = themes_field
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| self.theme_id_for(name))
            .collect();
        if theme_ids.is_empty() {
            return None;
        }

        let body = match kind {
            "qcm" => {
                let options: Vec<String> = answers_field
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect();
                let options: [String; 4] = options.try_into().ok()?;
                let correct: usize = correct_field.parse().ok()?;
                if correct > 3 {
                    return None;
                }
                QuestionBody::MultiChoice { options, correct }
            }
            "boolean" => QuestionBody::Boolean {
                correct: correct_field == "1",
            },
            "text" => {
                let accepted: Vec<String> = correct_field
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
                if accepted.is_empty() {
                    return None;
                }
                QuestionBody::Text { accepted }
            }
            _ => return None,
        };

        Some(Question {
            id,
            theme_ids,
            difficulty,
            prompt: prompt.to_string(),
            body,
            explanation,
        })
    }

    /// Finds or creates the theme with the given name.
    fn theme_id_for(&mut self, name: &str) -> u32 {
        if let Some(theme) = self.themes.iter().find(|t| t.name == name) {
            return theme.id;
        }
        let id = self.themes.len() as u32;
        self.themes.push(Theme {
            id,
            name: name.to_string(),
        });
        id
    }

    pub fn themes(&self) -> &[Theme] {
        &self.themes
    }

    pub fn theme_name(&self, id: u32) -> Option<&str> {
        self.themes
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.name.as_str())
    }

    pub fn get(&self, id: u32) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// Selects `count` distinct question ids matching the difficulty whose
    /// theme set intersects `theme_ids`, uniformly shuffled.
    pub fn select(
        &self,
        theme_ids: &[u32],
        difficulty: Difficulty,
        count: usize,
    ) -> Result<Vec<u32>, InsufficientQuestions> {
        let mut matching: Vec<u32> = self
            .questions
            .iter()
            .filter(|q| q.difficulty == difficulty)
            .filter(|q| q.theme_ids.iter().any(|t| theme_ids.contains(t)))
            .map(|q| q.id)
            .collect();

        if matching.len() < count {
            return Err(InsufficientQuestions {
                available: matching.len(),
                requested: count,
            });
        }

        matching.shuffle(&mut rand::thread_rng());
        matching.truncate(count);
        Ok(matching)
    }
}
