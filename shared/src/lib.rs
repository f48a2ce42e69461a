//! # Shared Protocol Library
//!
//! This crate contains everything the QuizNet server and its clients must
//! agree on: the line-framed request/response protocol vocabulary, the game
//! enumerations with their exact wire spellings, the server-initiated event
//! payloads, and the UDP discovery handshake strings.
//!
//! ## Wire Format
//!
//! A request is one or two LF-terminated lines: a header line of the form
//! `METHOD endpoint` (`GET` or `POST`), and for `POST` exactly one
//! single-line JSON object as the body. Every response and event is a single
//! JSON object on one line. Lines are bounded at [`MAX_LINE_LEN`] bytes.
//!
//! Responses always carry `action` (echoing the endpoint), `statut` (an
//! HTTP-style code as a string) and `message`. Events carry `action` and
//! their payload, and never a `statut` field.
//!
//! ## Bilingual difficulties
//!
//! Difficulty levels serialize as their French spellings (`facile`, `moyen`,
//! `difficile`) and parse from both French and English. This asymmetry is
//! part of the wire contract with the existing desktop client and must not
//! be "fixed".

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Default TCP port for game connections
pub const DEFAULT_TCP_PORT: u16 = 5556;

/// Default UDP port for LAN discovery
pub const DEFAULT_UDP_PORT: u16 = 5555;

/// Upper bound for a single protocol line, in bytes.
///
/// Anything longer is dropped and the peer disconnected.
pub const MAX_LINE_LEN: usize = 8192;

/// Exact probe payload clients broadcast when looking for servers
pub const DISCOVERY_PROBE: &str = "looking for quiznet servers";

/// Builds the discovery advertisement answered to a [`DISCOVERY_PROBE`]
pub fn discovery_advertisement(server_name: &str, tcp_port: u16) -> String {
    format!("hello i'm a quiznet server:{}:{}", server_name, tcp_port)
}

/// Question difficulty levels.
///
/// The wire spelling is French; parsing accepts English as well. Unknown
/// spellings fall back to [`Difficulty::Medium`], matching the behavior the
/// deployed clients rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "facile",
            Difficulty::Medium => "moyen",
            Difficulty::Hard => "difficile",
        }
    }

    /// Parses both French and English spellings, case-insensitively.
    pub fn parse(s: &str) -> Difficulty {
        match s.trim().to_ascii_lowercase().as_str() {
            "facile" | "easy" => Difficulty::Easy,
            "difficile" | "hard" => Difficulty::Hard,
            _ => Difficulty::Medium,
        }
    }
}

impl Serialize for Difficulty {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Difficulty {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Difficulty::parse(&s))
    }
}

/// Game modes available for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameMode {
    Solo,
    Battle,
}

impl GameMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameMode::Solo => "solo",
            GameMode::Battle => "battle",
        }
    }

    pub fn parse(s: &str) -> Option<GameMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "solo" => Some(GameMode::Solo),
            "battle" => Some(GameMode::Battle),
            _ => None,
        }
    }
}

impl Serialize for GameMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for GameMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        GameMode::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown game mode '{}'", s)))
    }
}

/// The three question kinds the quiz system supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionKind {
    /// Multiple choice with exactly four options
    MultiChoice,
    /// True/false
    Boolean,
    /// Free text with one or more accepted answers
    Text,
}

impl QuestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::MultiChoice => "qcm",
            QuestionKind::Boolean => "boolean",
            QuestionKind::Text => "text",
        }
    }
}

impl Serialize for QuestionKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// The two single-use jokers each player holds per session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JokerKind {
    Fifty,
    Skip,
}

impl JokerKind {
    pub fn parse(s: &str) -> Option<JokerKind> {
        match s {
            "fifty" => Some(JokerKind::Fifty),
            "skip" => Some(JokerKind::Skip),
            _ => None,
        }
    }
}

/// A submitted answer, whose JSON type depends on the current question kind:
/// an option index for multi-choice, a boolean, or a free-text string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Choice(i64),
    Flag(bool),
    Text(String),
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// Body of `player/register` and `player/login`
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub pseudo: String,
    pub password: String,
}

/// Body of `session/create`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub name: String,
    pub theme_ids: Vec<u32>,
    pub difficulty: Difficulty,
    pub nb_questions: u32,
    pub time_limit: u32,
    pub mode: GameMode,
    pub max_players: u32,
    /// Required in battle mode, ignored in solo
    pub lives: Option<i64>,
}

/// Body of `session/join`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionBody {
    pub session_id: u32,
}

/// Body of `question/answer`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerBody {
    pub answer: Option<AnswerValue>,
    pub response_time: f64,
}

/// Body of `joker/use`
#[derive(Debug, Clone, Deserialize)]
pub struct JokerBody {
    #[serde(rename = "type")]
    pub kind: String,
}

// ---------------------------------------------------------------------------
// Server-initiated events
// ---------------------------------------------------------------------------

/// `session/player/joined` — sent to members other than the joiner
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerJoinedEvent {
    pub action: &'static str,
    pub pseudo: String,
    pub nb_players: usize,
}

impl PlayerJoinedEvent {
    pub fn new(pseudo: String, nb_players: usize) -> Self {
        Self {
            action: "session/player/joined",
            pseudo,
            nb_players,
        }
    }
}

/// `session/player/left` — sent to remaining members
#[derive(Debug, Clone, Serialize)]
pub struct PlayerLeftEvent {
    pub action: &'static str,
    pub pseudo: String,
    pub reason: &'static str,
}

impl PlayerLeftEvent {
    pub fn new(pseudo: String) -> Self {
        Self {
            action: "session/player/left",
            pseudo,
            reason: "disconnected",
        }
    }
}

/// `session/started` — the game begins after `countdown` seconds
#[derive(Debug, Clone, Serialize)]
pub struct SessionStartedEvent {
    pub action: &'static str,
    pub message: &'static str,
    pub countdown: u32,
}

impl SessionStartedEvent {
    pub fn new(countdown: u32) -> Self {
        Self {
            action: "session/started",
            message: "session is starting",
            countdown,
        }
    }
}

/// `question/new` — sent to every non-eliminated member
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewQuestionEvent {
    pub action: &'static str,
    /// 1-based question number
    pub question_num: usize,
    pub total_questions: usize,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub difficulty: Difficulty,
    pub question: String,
    pub time_limit: u32,
    /// The four options, in stored order (multi-choice only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answers: Option<Vec<String>>,
}

/// One per-player entry inside [`QuestionResultsEvent`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResult {
    pub pseudo: String,
    /// The submitted value; `-2` for a skip, `-1` when unanswered
    pub answer: serde_json::Value,
    pub correct: bool,
    pub points: i64,
    pub total_score: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lives: Option<i64>,
}

/// `question/results` — sent to all members including eliminated players
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResultsEvent {
    pub action: &'static str,
    /// Correct option index for qcm/boolean, the first accepted answer for text
    pub correct_answer: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// Pseudo of the slowest answerer this question (battle only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_player: Option<String>,
    pub results: Vec<PlayerResult>,
}

/// `session/player/eliminated` — one per newly eliminated player
#[derive(Debug, Clone, Serialize)]
pub struct PlayerEliminatedEvent {
    pub action: &'static str,
    pub pseudo: String,
}

impl PlayerEliminatedEvent {
    pub fn new(pseudo: String) -> Self {
        Self {
            action: "session/player/eliminated",
            pseudo,
        }
    }
}

/// One entry of the final ranking inside [`SessionFinishedEvent`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingEntry {
    /// 1-based rank
    pub rank: usize,
    pub pseudo: String,
    pub score: i64,
    pub correct_answers: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lives: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eliminated_at: Option<u32>,
}

/// `session/finished` — final ranking, exactly once per session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFinishedEvent {
    pub action: &'static str,
    pub mode: GameMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    pub ranking: Vec<RankingEntry>,
}

/// Summary of a session, as listed by `sessions/list`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: u32,
    pub name: String,
    pub theme_ids: Vec<u32>,
    pub theme_names: Vec<String>,
    pub difficulty: Difficulty,
    pub nb_questions: usize,
    pub time_limit: u32,
    pub mode: GameMode,
    pub nb_players: usize,
    pub max_players: usize,
    pub status: &'static str,
}
