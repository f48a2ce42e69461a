//! The session engine: lifecycle, timing, scoring, jokers, elimination and
//! broadcast for one game session.
//!
//! Each session runs as a dedicated task owning all of its state. Every
//! input — join, leave, start, answer, joker, snapshot — arrives through one
//! mpsc inbox, and the three timed transitions (start countdown, question
//! timeout, inter-question pause) are timer arms on the same `select!` loop.
//! Members therefore observe events in a single, total order, duplicate
//! answers are trivially idempotent, and ending the session cancels all
//! pending timers by letting the task return.
//!
//! The task exits when the session finishes or the last player leaves;
//! the closed inbox is what the rest of the server observes as "finished".

use crate::client_manager::ClientManager;
use crate::question_bank::{points_for, Question, QuestionBank, QuestionBody};
use log::{debug, error, info};
use rand::seq::SliceRandom;
use serde::Serialize;
use shared::{
    AnswerValue, Difficulty, GameMode, JokerKind, NewQuestionEvent, PlayerEliminatedEvent,
    PlayerJoinedEvent, PlayerLeftEvent, PlayerResult, QuestionResultsEvent, RankingEntry,
    SessionFinishedEvent, SessionStartedEvent, SessionSummary,
};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{sleep_until, Duration, Instant};

/// Seconds between `session/started` and the first question
pub const COUNTDOWN_SECS: u64 = 3;

/// Reading pause between a question's results and the next question
pub const INTERMISSION_SECS: u64 = 5;

/// Grace added to the question deadline. Response times are clamped to
/// `time_limit + TIMEOUT_GRACE_SECS`, and the timeout fires at the same
/// bound, so a clamped answer can never arrive after its own deadline.
pub const TIMEOUT_GRACE_SECS: u64 = 1;

/// Hard cap on players in one session
pub const MAX_PLAYERS_PER_SESSION: usize = 10;

const INBOX_LEN: usize = 64;

/// Immutable configuration a session is created with
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub theme_ids: Vec<u32>,
    pub difficulty: Difficulty,
    pub nb_questions: usize,
    /// Per-question time limit, seconds
    pub time_limit: u32,
    pub mode: GameMode,
    /// Starting lives in battle mode, 0 in solo
    pub initial_lives: i64,
    pub max_players: usize,
}

/// Why a join was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    NotWaiting,
    Full,
    AlreadyJoined,
}

/// Successful join: what the join/create response needs
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub session_id: u32,
    pub mode: GameMode,
    pub is_creator: bool,
    pub players: Vec<String>,
    /// Initial lives, battle mode only
    pub lives: Option<i64>,
}

/// Why a start was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    NotWaiting,
    NotCreator,
    NotEnoughPlayers,
}

/// Why an answer was refused outright (ignored answers are still acked)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerError {
    NotPlaying,
}

/// Why a joker was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JokerError {
    NotAvailable,
    NotPlaying,
    NotMember,
}

/// Successful joker use
#[derive(Debug, Clone)]
pub struct JokerInfo {
    /// The two options left over after a fifty: the correct one and a decoy
    pub remaining_answers: Option<Vec<String>>,
    pub fifty_left: bool,
    pub skip_left: bool,
}

/// Commands accepted by a session's inbox
pub enum SessionCmd {
    Join {
        client_id: u32,
        pseudo: String,
        reply: oneshot::Sender<Result<JoinInfo, JoinError>>,
    },
    Leave {
        client_id: u32,
    },
    Start {
        client_id: u32,
        reply: oneshot::Sender<Result<(), StartError>>,
    },
    Answer {
        client_id: u32,
        answer: Option<AnswerValue>,
        response_time: f64,
        reply: oneshot::Sender<Result<(), AnswerError>>,
    },
    Joker {
        client_id: u32,
        kind: JokerKind,
        reply: oneshot::Sender<Result<JokerInfo, JokerError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSummary>,
    },
}

/// Cheap, cloneable handle to a running session task.
///
/// All methods return `None` once the session has finished (its inbox is
/// closed); a finished session is a tombstone and accepts no further input.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub id: u32,
    tx: mpsc::Sender<SessionCmd>,
}

impl SessionHandle {
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn join(&self, client_id: u32, pseudo: String) -> Option<Result<JoinInfo, JoinError>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCmd::Join { client_id, pseudo, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn leave(&self, client_id: u32) {
        let _ = self.tx.send(SessionCmd::Leave { client_id }).await;
    }

    pub async fn start(&self, client_id: u32) -> Option<Result<(), StartError>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCmd::Start { client_id, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn answer(
        &self,
        client_id: u32,
        answer: Option<AnswerValue>,
        response_time: f64,
    ) -> Option<Result<(), AnswerError>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCmd::Answer { client_id, answer, response_time, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn joker(&self, client_id: u32, kind: JokerKind) -> Option<Result<JokerInfo, JokerError>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCmd::Joker { client_id, kind, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn snapshot(&self) -> Option<SessionSummary> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SessionCmd::Snapshot { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Spawns a new session task in the waiting state and returns its handle.
///
/// `question_ids` is the pre-selected question sequence; the creator is NOT
/// joined here — the dispatcher joins them right after.
pub fn spawn(
    id: u32,
    cfg: SessionConfig,
    question_ids: Vec<u32>,
    creator: u32,
    clients: Arc<RwLock<ClientManager>>,
    bank: Arc<QuestionBank>,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(INBOX_LEN);
    let actor = SessionActor {
        id,
        cfg,
        question_ids,
        creator,
        players: Vec::new(),
        status: Status::Waiting,
        phase: Phase::Waiting,
        current: None,
        clients,
        bank,
    };
    tokio::spawn(actor.run(rx));
    SessionHandle { id, tx }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Waiting,
    Playing,
    Finished,
}

/// Where the session is in its timed lifecycle
#[derive(Debug, Clone, Copy)]
enum Phase {
    Waiting,
    /// `session/started` sent, first question at `until`
    Countdown { until: Instant },
    /// A question is open, timeout at `deadline`
    Question { deadline: Instant },
    /// Results sent, next question at `until`
    Intermission { until: Instant },
}

/// What a player submitted for the current question
#[derive(Debug, Clone, PartialEq)]
enum AnswerRecord {
    None,
    Skipped,
    Value(AnswerValue),
}

impl AnswerRecord {
    /// Wire form: `-1` unanswered, `-2` skipped, else the submitted value
    fn to_wire(&self) -> serde_json::Value {
        match self {
            AnswerRecord::None => serde_json::json!(-1),
            AnswerRecord::Skipped => serde_json::json!(-2),
            AnswerRecord::Value(v) => serde_json::json!(v),
        }
    }
}

#[derive(Debug, Clone)]
struct PlayerState {
    client_id: u32,
    pseudo: String,
    score: i64,
    correct_answers: u32,
    lives: i64,
    has_answered: bool,
    was_correct: bool,
    answer: AnswerRecord,
    response_time: f64,
    /// Points awarded for the current question
    last_points: i64,
    eliminated: bool,
    /// 1-based question number of elimination, 0 while alive
    eliminated_at: u32,
    fifty_used: bool,
    skip_used: bool,
    skipped_this_question: bool,
}

impl PlayerState {
    fn new(client_id: u32, pseudo: String, lives: i64) -> Self {
        Self {
            client_id,
            pseudo,
            score: 0,
            correct_answers: 0,
            lives,
            has_answered: false,
            was_correct: false,
            answer: AnswerRecord::None,
            response_time: 0.0,
            last_points: 0,
            eliminated: false,
            eliminated_at: 0,
            fifty_used: false,
            skip_used: false,
            skipped_this_question: false,
        }
    }
}

struct SessionActor {
    id: u32,
    cfg: SessionConfig,
    question_ids: Vec<u32>,
    creator: u32,
    players: Vec<PlayerState>,
    status: Status,
    phase: Phase,
    /// Index into `question_ids`; `None` before the first dispatch
    current: Option<usize>,
    clients: Arc<RwLock<ClientManager>>,
    bank: Arc<QuestionBank>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionCmd>) {
        info!(
            "Session {} ('{}') open: {:?} {}, {} questions, {}s per question",
            self.id,
            self.cfg.name,
            self.cfg.mode,
            self.cfg.difficulty.as_str(),
            self.cfg.nb_questions,
            self.cfg.time_limit
        );

        loop {
            let deadline = match self.phase {
                Phase::Waiting => None,
                Phase::Countdown { until } | Phase::Intermission { until } => Some(until),
                Phase::Question { deadline } => Some(deadline),
            };
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await.is_break() {
                            break;
                        }
                    }
                    // Every handle dropped; nothing can reach this session anymore
                    None => break,
                },
                _ = timer => {
                    if self.on_deadline().await.is_break() {
                        break;
                    }
                }
            }
        }

        info!("Session {} closed", self.id);
    }

    async fn handle_command(&mut self, cmd: SessionCmd) -> ControlFlow<()> {
        match cmd {
            SessionCmd::Join { client_id, pseudo, reply } => {
                let _ = reply.send(self.join(client_id, pseudo).await);
                ControlFlow::Continue(())
            }
            SessionCmd::Leave { client_id } => self.leave(client_id).await,
            SessionCmd::Start { client_id, reply } => {
                let _ = reply.send(self.start(client_id).await);
                ControlFlow::Continue(())
            }
            SessionCmd::Answer { client_id, answer, response_time, reply } => {
                let (result, flow) = self.answer(client_id, answer, response_time).await;
                let _ = reply.send(result);
                flow
            }
            SessionCmd::Joker { client_id, kind, reply } => {
                let (result, flow) = self.joker(client_id, kind).await;
                let _ = reply.send(result);
                flow
            }
            SessionCmd::Snapshot { reply } => {
                let _ = reply.send(self.summary());
                ControlFlow::Continue(())
            }
        }
    }

    /// Timed transition for the current phase.
    async fn on_deadline(&mut self) -> ControlFlow<()> {
        match self.phase {
            Phase::Waiting => ControlFlow::Continue(()),
            Phase::Countdown { .. } => self.dispatch_question(0).await,
            Phase::Question { .. } => {
                debug!("Session {}: question timed out", self.id);
                let unanswered_time = (self.cfg.time_limit as u64 + TIMEOUT_GRACE_SECS) as f64;
                for p in &mut self.players {
                    if !p.eliminated && !p.has_answered {
                        p.was_correct = false;
                        p.answer = AnswerRecord::None;
                        p.response_time = unanswered_time;
                        p.last_points = 0;
                    }
                }
                self.finish_question().await
            }
            Phase::Intermission { .. } => {
                let next = self.current.map_or(0, |i| i + 1);
                self.dispatch_question(next).await
            }
        }
    }

    async fn join(&mut self, client_id: u32, pseudo: String) -> Result<JoinInfo, JoinError> {
        if self.status != Status::Waiting {
            return Err(JoinError::NotWaiting);
        }
        if self.players.len() >= self.cfg.max_players {
            return Err(JoinError::Full);
        }
        if self.player_index(client_id).is_some() {
            return Err(JoinError::AlreadyJoined);
        }

        self.players
            .push(PlayerState::new(client_id, pseudo.clone(), self.cfg.initial_lives));
        info!(
            "Session {}: '{}' joined ({}/{})",
            self.id,
            pseudo,
            self.players.len(),
            self.cfg.max_players
        );

        // A join broadcast only reaches members present before this join
        let others: Vec<u32> = self.players[..self.players.len() - 1]
            .iter()
            .map(|p| p.client_id)
            .collect();
        self.broadcast_to(&others, &PlayerJoinedEvent::new(pseudo, self.players.len()))
            .await;

        Ok(JoinInfo {
            session_id: self.id,
            mode: self.cfg.mode,
            is_creator: client_id == self.creator,
            players: self.players.iter().map(|p| p.pseudo.clone()).collect(),
            lives: (self.cfg.mode == GameMode::Battle).then_some(self.cfg.initial_lives),
        })
    }

    async fn leave(&mut self, client_id: u32) -> ControlFlow<()> {
        let Some(index) = self.player_index(client_id) else {
            return ControlFlow::Continue(());
        };
        let leaving = self.players.remove(index);
        info!("Session {}: '{}' left", self.id, leaving.pseudo);

        if client_id == self.creator {
            if let Some(first) = self.players.first() {
                self.creator = first.client_id;
                info!("Session {}: '{}' is the new creator", self.id, first.pseudo);
            }
        }

        self.broadcast_all(&PlayerLeftEvent::new(leaving.pseudo)).await;

        if self.players.is_empty() {
            // Nobody left to notify; the session just disappears
            self.status = Status::Finished;
            return ControlFlow::Break(());
        }
        if self.status == Status::Playing {
            if self.players.len() == 1 {
                return self.end_game().await;
            }
            // The leaver may have been the last player everyone was waiting on
            if matches!(self.phase, Phase::Question { .. }) && self.all_active_answered() {
                return self.finish_question().await;
            }
        }
        ControlFlow::Continue(())
    }

    async fn start(&mut self, client_id: u32) -> Result<(), StartError> {
        if self.status != Status::Waiting {
            return Err(StartError::NotWaiting);
        }
        if client_id != self.creator {
            return Err(StartError::NotCreator);
        }
        if self.players.len() < 2 {
            return Err(StartError::NotEnoughPlayers);
        }

        self.status = Status::Playing;
        self.current = None;
        self.phase = Phase::Countdown {
            until: Instant::now() + Duration::from_secs(COUNTDOWN_SECS),
        };
        info!("Session {}: starting with {} players", self.id, self.players.len());
        self.broadcast_all(&SessionStartedEvent::new(COUNTDOWN_SECS as u32))
            .await;
        Ok(())
    }

    /// Opens question `index` for answers and sends it to active players.
    async fn dispatch_question(&mut self, index: usize) -> ControlFlow<()> {
        let bank = self.bank.clone();
        let question = match self.question_ids.get(index).and_then(|id| bank.get(*id)) {
            Some(q) => q,
            None => {
                // A stale id here is an internal fault; close out the game
                error!("Session {}: no question at index {}", self.id, index);
                return self.end_game().await;
            }
        };

        self.current = Some(index);
        for p in &mut self.players {
            p.has_answered = false;
            p.was_correct = false;
            p.answer = AnswerRecord::None;
            p.response_time = 0.0;
            p.last_points = 0;
            p.skipped_this_question = false;
        }
        self.phase = Phase::Question {
            deadline: Instant::now()
                + Duration::from_secs(self.cfg.time_limit as u64 + TIMEOUT_GRACE_SECS),
        };

        let event = NewQuestionEvent {
            action: "question/new",
            question_num: index + 1,
            total_questions: self.cfg.nb_questions,
            kind: question.kind(),
            difficulty: question.difficulty,
            question: question.prompt.clone(),
            time_limit: self.cfg.time_limit,
            answers: match &question.body {
                QuestionBody::MultiChoice { options, .. } => Some(options.to_vec()),
                _ => None,
            },
        };

        info!(
            "Session {}: question {}/{} dispatched",
            self.id,
            index + 1,
            self.cfg.nb_questions
        );
        let active: Vec<u32> = self
            .players
            .iter()
            .filter(|p| !p.eliminated)
            .map(|p| p.client_id)
            .collect();
        self.broadcast_to(&active, &event).await;
        ControlFlow::Continue(())
    }

    async fn answer(
        &mut self,
        client_id: u32,
        answer: Option<AnswerValue>,
        response_time: f64,
    ) -> (Result<(), AnswerError>, ControlFlow<()>) {
        if self.status != Status::Playing {
            return (Err(AnswerError::NotPlaying), ControlFlow::Continue(()));
        }
        if !matches!(self.phase, Phase::Question { .. }) {
            // Between questions: nothing is open, the answer is ignored
            return (Ok(()), ControlFlow::Continue(()));
        }

        let bank = self.bank.clone();
        let question = self
            .current
            .and_then(|i| self.question_ids.get(i))
            .and_then(|id| bank.get(*id));
        let Some(question) = question else {
            return (Ok(()), ControlFlow::Continue(()));
        };
        let time_limit = self.cfg.time_limit;
        let Some(index) = self.player_index(client_id) else {
            return (Ok(()), ControlFlow::Continue(()));
        };

        let p = &mut self.players[index];
        if p.eliminated || p.has_answered {
            // Only the first answer per question is honored
            return (Ok(()), ControlFlow::Continue(()));
        }

        let max_time = (time_limit as u64 + TIMEOUT_GRACE_SECS) as f64;
        let response_time = if response_time.is_finite() && (0.0..=max_time).contains(&response_time)
        {
            response_time
        } else {
            max_time
        };

        p.has_answered = true;
        p.response_time = response_time;
        let correct = answer
            .as_ref()
            .map(|a| question.check_answer(a))
            .unwrap_or(false);
        p.answer = match answer {
            Some(value) => AnswerRecord::Value(value),
            None => AnswerRecord::None,
        };
        p.was_correct = correct;
        if correct {
            p.last_points = points_for(question.difficulty, response_time, time_limit);
            p.score += p.last_points;
            p.correct_answers += 1;
        }
        debug!(
            "Session {}: '{}' answered ({}, {:.2}s)",
            self.id,
            p.pseudo,
            if correct { "correct" } else { "wrong" },
            response_time
        );

        let flow = if self.all_active_answered() {
            self.finish_question().await
        } else {
            ControlFlow::Continue(())
        };
        (Ok(()), flow)
    }

    async fn joker(
        &mut self,
        client_id: u32,
        kind: JokerKind,
    ) -> (Result<JokerInfo, JokerError>, ControlFlow<()>) {
        if self.status != Status::Playing {
            return (Err(JokerError::NotPlaying), ControlFlow::Continue(()));
        }
        let Some(index) = self.player_index(client_id) else {
            return (Err(JokerError::NotMember), ControlFlow::Continue(()));
        };
        let in_question = matches!(self.phase, Phase::Question { .. });

        match kind {
            JokerKind::Fifty => {
                let bank = self.bank.clone();
                let question = self
                    .current
                    .and_then(|i| self.question_ids.get(i))
                    .and_then(|id| bank.get(*id));

                let p = &mut self.players[index];
                if p.fifty_used || p.has_answered || p.eliminated || !in_question {
                    return (Err(JokerError::NotAvailable), ControlFlow::Continue(()));
                }
                let Some(Question {
                    body: QuestionBody::MultiChoice { options, correct },
                    ..
                }) = question
                else {
                    return (Err(JokerError::NotAvailable), ControlFlow::Continue(()));
                };

                p.fifty_used = true;
                let mut wrong: Vec<usize> = (0..4).filter(|i| i != correct).collect();
                wrong.shuffle(&mut rand::thread_rng());
                let removed = [wrong[0], wrong[1]];
                let remaining: Vec<String> = (0..4)
                    .filter(|i| !removed.contains(i))
                    .map(|i| options[i].clone())
                    .collect();
                info!("Session {}: '{}' used the fifty joker", self.id, p.pseudo);

                let skip_left = !p.skip_used;
                (
                    Ok(JokerInfo {
                        remaining_answers: Some(remaining),
                        fifty_left: false,
                        skip_left,
                    }),
                    ControlFlow::Continue(()),
                )
            }
            JokerKind::Skip => {
                let p = &mut self.players[index];
                if p.skip_used || p.has_answered || p.eliminated || !in_question {
                    return (Err(JokerError::NotAvailable), ControlFlow::Continue(()));
                }
                p.skip_used = true;
                p.has_answered = true;
                p.skipped_this_question = true;
                p.was_correct = false;
                p.answer = AnswerRecord::Skipped;
                info!("Session {}: '{}' skipped the question", self.id, p.pseudo);

                let fifty_left = !p.fifty_used;
                let flow = if self.all_active_answered() {
                    self.finish_question().await
                } else {
                    ControlFlow::Continue(())
                };
                (
                    Ok(JokerInfo {
                        remaining_answers: None,
                        fifty_left,
                        skip_left: false,
                    }),
                    flow,
                )
            }
        }
    }

    /// Applies battle penalties, broadcasts results and elimination notices,
    /// then either ends the game or schedules the next question.
    async fn finish_question(&mut self) -> ControlFlow<()> {
        let bank = self.bank.clone();
        let Some(index) = self.current else {
            return self.end_game().await;
        };
        let Some(question) = self.question_ids.get(index).and_then(|id| bank.get(*id)) else {
            return self.end_game().await;
        };
        let question_num = (index + 1) as u32;
        let battle = self.cfg.mode == GameMode::Battle;

        let mut last_player = None;
        if battle {
            // A wrong (non-skip) answer costs a life
            for p in &mut self.players {
                if p.eliminated || p.skipped_this_question {
                    continue;
                }
                if p.has_answered && !p.was_correct {
                    p.lives -= 1;
                    if p.lives <= 0 {
                        p.eliminated = true;
                        p.eliminated_at = question_num;
                    }
                }
            }

            #[cfg(feature = "last-player-penalty")]
            {
                // The slowest non-skip answerer loses an extra life if they
                // were correct; ties go to the lowest player index
                let mut slowest: Option<usize> = None;
                for (i, p) in self.players.iter().enumerate() {
                    if !p.has_answered || p.skipped_this_question {
                        continue;
                    }
                    let slower = match slowest {
                        None => true,
                        Some(j) => p.response_time > self.players[j].response_time,
                    };
                    if slower {
                        slowest = Some(i);
                    }
                }
                if let Some(i) = slowest {
                    last_player = Some(self.players[i].pseudo.clone());
                    let p = &mut self.players[i];
                    if !p.eliminated && p.was_correct {
                        p.lives -= 1;
                        if p.lives <= 0 {
                            p.eliminated = true;
                            p.eliminated_at = question_num;
                        }
                    }
                }
            }
        }

        let results: Vec<PlayerResult> = self
            .players
            .iter()
            .map(|p| PlayerResult {
                pseudo: p.pseudo.clone(),
                answer: p.answer.to_wire(),
                correct: p.was_correct,
                points: p.last_points,
                total_score: p.score,
                response_time: battle.then_some(p.response_time),
                lives: battle.then_some(p.lives),
            })
            .collect();
        let event = QuestionResultsEvent {
            action: "question/results",
            correct_answer: question.correct_answer_value(),
            explanation: question.explanation.clone(),
            last_player,
            results,
        };
        // Results go to everyone, eliminated players included
        self.broadcast_all(&event).await;

        let newly_eliminated: Vec<String> = self
            .players
            .iter()
            .filter(|p| p.eliminated && p.eliminated_at == question_num)
            .map(|p| p.pseudo.clone())
            .collect();
        for pseudo in newly_eliminated {
            info!("Session {}: '{}' eliminated", self.id, pseudo);
            self.broadcast_all(&PlayerEliminatedEvent::new(pseudo)).await;
        }

        let active = self.players.iter().filter(|p| !p.eliminated).count();
        if battle && active <= 1 {
            return self.end_game().await;
        }
        if index + 1 >= self.cfg.nb_questions {
            return self.end_game().await;
        }
        self.phase = Phase::Intermission {
            until: Instant::now() + Duration::from_secs(INTERMISSION_SECS),
        };
        ControlFlow::Continue(())
    }

    /// Final ranking, `session/finished` broadcast, membership cleanup.
    async fn end_game(&mut self) -> ControlFlow<()> {
        self.status = Status::Finished;
        let battle = self.cfg.mode == GameMode::Battle;

        let mut ranked: Vec<&PlayerState> = self.players.iter().collect();
        ranked.sort_by(|a, b| {
            if battle {
                b.lives
                    .cmp(&a.lives)
                    .then(b.eliminated_at.cmp(&a.eliminated_at))
                    .then(b.score.cmp(&a.score))
            } else {
                b.score.cmp(&a.score)
            }
        });

        let ranking: Vec<RankingEntry> = ranked
            .iter()
            .enumerate()
            .map(|(i, p)| RankingEntry {
                rank: i + 1,
                pseudo: p.pseudo.clone(),
                score: p.score,
                correct_answers: p.correct_answers,
                lives: battle.then_some(p.lives),
                eliminated_at: (battle && p.eliminated).then_some(p.eliminated_at),
            })
            .collect();
        let winner = if battle {
            ranked.first().map(|p| p.pseudo.clone())
        } else {
            None
        };

        let event = SessionFinishedEvent {
            action: "session/finished",
            mode: self.cfg.mode,
            winner,
            ranking,
        };
        self.broadcast_all(&event).await;

        let member_ids: Vec<u32> = self.players.iter().map(|p| p.client_id).collect();
        {
            let mut clients = self.clients.write().await;
            for id in &member_ids {
                clients.set_session(*id, None);
            }
        }
        info!("Session {}: finished", self.id);
        ControlFlow::Break(())
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            name: self.cfg.name.clone(),
            theme_ids: self.cfg.theme_ids.clone(),
            theme_names: self
                .cfg
                .theme_ids
                .iter()
                .filter_map(|id| self.bank.theme_name(*id).map(String::from))
                .collect(),
            difficulty: self.cfg.difficulty,
            nb_questions: self.cfg.nb_questions,
            time_limit: self.cfg.time_limit,
            mode: self.cfg.mode,
            nb_players: self.players.len(),
            max_players: self.cfg.max_players,
            status: match self.status {
                Status::Waiting => "waiting",
                Status::Playing => "playing",
                Status::Finished => "finished",
            },
        }
    }

    fn player_index(&self, client_id: u32) -> Option<usize> {
        self.players.iter().position(|p| p.client_id == client_id)
    }

    fn all_active_answered(&self) -> bool {
        self.players.iter().all(|p| p.eliminated || p.has_answered)
    }

    async fn broadcast_all<T: Serialize>(&self, msg: &T) {
        let ids: Vec<u32> = self.players.iter().map(|p| p.client_id).collect();
        self.broadcast_to(&ids, msg).await;
    }

    /// Serializes once, then fans out through the client table. The table
    /// lock is only held for the enqueue, never while building the payload.
    async fn broadcast_to<T: Serialize>(&self, ids: &[u32], msg: &T) {
        let line = match serde_json::to_string(msg) {
            Ok(line) => line,
            Err(e) => {
                error!("Session {}: failed to serialize event: {}", self.id, e);
                return;
            }
        };
        let clients = self.clients.read().await;
        clients.send_to_many(ids, &line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::SEND_QUEUE_LEN;
    use crate::question_bank::Theme;
    use serde_json::Value;
    use tokio::sync::Notify;

    fn test_bank() -> Arc<QuestionBank> {
        let themes = vec![Theme { id: 0, name: "general".into() }];
        let questions = (1..=12)
            .map(|id| Question {
                id,
                theme_ids: vec![0],
                difficulty: Difficulty::Medium,
                prompt: format!("question {}", id),
                body: QuestionBody::MultiChoice {
                    options: ["A".into(), "B".into(), "C".into(), "D".into()],
                    correct: 2,
                },
                explanation: None,
            })
            .collect();
        Arc::new(QuestionBank::from_parts(themes, questions))
    }

    fn config(mode: GameMode, lives: i64, nb_questions: usize) -> SessionConfig {
        SessionConfig {
            name: "test".into(),
            theme_ids: vec![0],
            difficulty: Difficulty::Medium,
            nb_questions,
            time_limit: 20,
            mode,
            initial_lives: lives,
            max_players: 4,
        }
    }

    struct Harness {
        handle: SessionHandle,
        clients: Arc<RwLock<ClientManager>>,
        inboxes: Vec<mpsc::Receiver<String>>,
    }

    /// Spawns a session plus `n` registered fake clients (ids 1..=n),
    /// client 1 being the creator. Nobody is joined yet.
    async fn harness(cfg: SessionConfig, n: usize) -> Harness {
        let mut manager = ClientManager::new(16);
        let mut inboxes = Vec::new();
        for _ in 0..n {
            let (tx, rx) = mpsc::channel(SEND_QUEUE_LEN);
            manager
                .add_client("127.0.0.1:1".parse().unwrap(), tx, Arc::new(Notify::new()))
                .unwrap();
            inboxes.push(rx);
        }
        let clients = Arc::new(RwLock::new(manager));
        let bank = test_bank();
        let question_ids = bank
            .select(&cfg.theme_ids, cfg.difficulty, cfg.nb_questions)
            .unwrap();
        let handle = spawn(1, cfg, question_ids, 1, clients.clone(), bank);
        Harness { handle, clients, inboxes }
    }

    async fn next_event(rx: &mut mpsc::Receiver<String>) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        serde_json::from_str(&line).unwrap()
    }

    async fn next_action(rx: &mut mpsc::Receiver<String>, action: &str) -> Value {
        loop {
            let event = next_event(rx).await;
            if event["action"] == action {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn join_enforces_capacity_and_uniqueness() {
        let mut cfg = config(GameMode::Solo, 0, 10);
        cfg.max_players = 2;
        let h = harness(cfg, 3).await;

        let info = h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        assert!(info.is_creator);
        assert_eq!(info.players, vec!["alice"]);

        assert_eq!(
            h.handle.join(1, "alice".into()).await.unwrap().unwrap_err(),
            JoinError::AlreadyJoined
        );

        let info = h.handle.join(2, "bob".into()).await.unwrap().unwrap();
        assert!(!info.is_creator);
        assert_eq!(info.players, vec!["alice", "bob"]);

        assert_eq!(
            h.handle.join(3, "carol".into()).await.unwrap().unwrap_err(),
            JoinError::Full
        );
    }

    #[tokio::test]
    async fn join_notifies_only_earlier_members() {
        let mut h = harness(config(GameMode::Solo, 0, 10), 2).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        h.handle.join(2, "bob".into()).await.unwrap().unwrap();

        let event = next_action(&mut h.inboxes[0], "session/player/joined").await;
        assert_eq!(event["pseudo"], "bob");
        assert_eq!(event["nbPlayers"], 2);

        // Bob got nothing: the join broadcast predates his membership
        assert!(h.inboxes[1].try_recv().is_err());
    }

    #[tokio::test]
    async fn start_requires_creator_and_two_players() {
        let h = harness(config(GameMode::Solo, 0, 10), 2).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();

        assert_eq!(
            h.handle.start(1).await.unwrap().unwrap_err(),
            StartError::NotEnoughPlayers
        );

        h.handle.join(2, "bob".into()).await.unwrap().unwrap();
        assert_eq!(
            h.handle.start(2).await.unwrap().unwrap_err(),
            StartError::NotCreator
        );

        assert!(h.handle.start(1).await.unwrap().is_ok());
        assert_eq!(
            h.handle.start(1).await.unwrap().unwrap_err(),
            StartError::NotWaiting
        );
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_then_first_question_reaches_everyone() {
        let mut h = harness(config(GameMode::Solo, 0, 10), 2).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        h.handle.join(2, "bob".into()).await.unwrap().unwrap();
        h.handle.start(1).await.unwrap().unwrap();

        for rx in h.inboxes.iter_mut() {
            let started = next_action(rx, "session/started").await;
            assert_eq!(started["countdown"], 3);

            let question = next_action(rx, "question/new").await;
            assert_eq!(question["questionNum"], 1);
            assert_eq!(question["totalQuestions"], 10);
            assert_eq!(question["type"], "qcm");
            assert_eq!(question["timeLimit"], 20);
            assert_eq!(question["answers"].as_array().unwrap().len(), 4);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scoring_awards_base_and_speed_bonus() {
        let mut h = harness(config(GameMode::Solo, 0, 10), 2).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        h.handle.join(2, "bob".into()).await.unwrap().unwrap();
        h.handle.start(1).await.unwrap().unwrap();
        next_action(&mut h.inboxes[0], "question/new").await;

        // Medium, Tq=20: alice fast and right (10+3), bob wrong (0)
        h.handle
            .answer(1, Some(AnswerValue::Choice(2)), 5.0)
            .await
            .unwrap()
            .unwrap();
        h.handle
            .answer(2, Some(AnswerValue::Choice(0)), 12.0)
            .await
            .unwrap()
            .unwrap();

        let results = next_action(&mut h.inboxes[0], "question/results").await;
        assert_eq!(results["correctAnswer"], 2);
        let entries = results["results"].as_array().unwrap();
        let alice = entries.iter().find(|e| e["pseudo"] == "alice").unwrap();
        let bob = entries.iter().find(|e| e["pseudo"] == "bob").unwrap();
        assert_eq!(alice["points"], 13);
        assert_eq!(alice["totalScore"], 13);
        assert_eq!(alice["correct"], true);
        assert_eq!(bob["points"], 0);
        assert_eq!(bob["totalScore"], 0);
        assert_eq!(bob["correct"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn second_answer_is_ignored() {
        let mut h = harness(config(GameMode::Solo, 0, 10), 2).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        h.handle.join(2, "bob".into()).await.unwrap().unwrap();
        h.handle.start(1).await.unwrap().unwrap();
        next_action(&mut h.inboxes[0], "question/new").await;

        h.handle
            .answer(1, Some(AnswerValue::Choice(2)), 5.0)
            .await
            .unwrap()
            .unwrap();
        // A second answer from alice must not change anything, and is acked
        h.handle
            .answer(1, Some(AnswerValue::Choice(0)), 1.0)
            .await
            .unwrap()
            .unwrap();
        h.handle
            .answer(2, Some(AnswerValue::Choice(0)), 8.0)
            .await
            .unwrap()
            .unwrap();

        let results = next_action(&mut h.inboxes[0], "question/results").await;
        let entries = results["results"].as_array().unwrap();
        let alice = entries.iter().find(|e| e["pseudo"] == "alice").unwrap();
        assert_eq!(alice["correct"], true);
        assert_eq!(alice["answer"], 2);
        assert_eq!(alice["totalScore"], 13);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_records_non_answerers() {
        let mut h = harness(config(GameMode::Solo, 0, 10), 2).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        h.handle.join(2, "bob".into()).await.unwrap().unwrap();
        h.handle.start(1).await.unwrap().unwrap();
        next_action(&mut h.inboxes[0], "question/new").await;

        h.handle
            .answer(1, Some(AnswerValue::Choice(2)), 3.0)
            .await
            .unwrap()
            .unwrap();
        // Bob never answers; the question deadline fires on its own
        let results = next_action(&mut h.inboxes[0], "question/results").await;
        let entries = results["results"].as_array().unwrap();
        let bob = entries.iter().find(|e| e["pseudo"] == "bob").unwrap();
        assert_eq!(bob["answer"], -1);
        assert_eq!(bob["correct"], false);
        assert_eq!(bob["points"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn battle_timeout_costs_no_life() {
        let mut h = harness(config(GameMode::Battle, 2, 10), 2).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        h.handle.join(2, "bob".into()).await.unwrap().unwrap();
        h.handle.start(1).await.unwrap().unwrap();
        next_action(&mut h.inboxes[0], "question/new").await;

        // Alice answers wrong; bob lets the question time out. Only a
        // submitted wrong answer costs a life, not a missing one.
        h.handle
            .answer(1, Some(AnswerValue::Choice(0)), 3.0)
            .await
            .unwrap()
            .unwrap();

        let results = next_action(&mut h.inboxes[0], "question/results").await;
        let entries = results["results"].as_array().unwrap();
        let alice = entries.iter().find(|e| e["pseudo"] == "alice").unwrap();
        let bob = entries.iter().find(|e| e["pseudo"] == "bob").unwrap();
        assert_eq!(alice["lives"], 1);
        assert_eq!(bob["lives"], 2);
        assert_eq!(bob["answer"], -1);
        assert_eq!(bob["correct"], false);
        // The timed-out player is recorded at the clamp bound
        assert_eq!(bob["responseTime"], 21.0);
    }

    #[tokio::test(start_paused = true)]
    async fn battle_double_elimination_ends_the_session() {
        let mut h = harness(config(GameMode::Battle, 1, 10), 2).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        h.handle.join(2, "bob".into()).await.unwrap().unwrap();
        h.handle.start(1).await.unwrap().unwrap();
        next_action(&mut h.inboxes[0], "question/new").await;

        // Both wrong with one life each: both eliminated, game over
        h.handle
            .answer(1, Some(AnswerValue::Choice(0)), 2.0)
            .await
            .unwrap()
            .unwrap();
        h.handle
            .answer(2, Some(AnswerValue::Choice(1)), 4.0)
            .await
            .unwrap()
            .unwrap();

        let results = next_action(&mut h.inboxes[0], "question/results").await;
        let entries = results["results"].as_array().unwrap();
        for entry in entries {
            assert_eq!(entry["lives"], 0);
        }

        next_action(&mut h.inboxes[0], "session/player/eliminated").await;
        next_action(&mut h.inboxes[0], "session/player/eliminated").await;

        let finished = next_action(&mut h.inboxes[0], "session/finished").await;
        assert_eq!(finished["mode"], "battle");
        assert!(finished["winner"].is_string());
        let ranking = finished["ranking"].as_array().unwrap();
        assert_eq!(ranking.len(), 2);
        assert_eq!(ranking[0]["rank"], 1);
        assert_eq!(ranking[0]["eliminatedAt"], 1);

        // The actor is gone; the handle observes a tombstone
        let _ = h.handle.snapshot().await;
        assert!(h.handle.join(3, "late".into()).await.is_none());

        // Memberships were cleared at end
        let clients = h.clients.read().await;
        assert_eq!(clients.session_of(1), None);
        assert_eq!(clients.session_of(2), None);
    }

    #[cfg(feature = "last-player-penalty")]
    #[tokio::test(start_paused = true)]
    async fn slowest_correct_answerer_pays_the_last_player_penalty() {
        let mut h = harness(config(GameMode::Battle, 3, 10), 2).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        h.handle.join(2, "bob".into()).await.unwrap().unwrap();
        h.handle.start(1).await.unwrap().unwrap();
        next_action(&mut h.inboxes[0], "question/new").await;

        // Both correct; bob is slower and loses the extra life
        h.handle
            .answer(1, Some(AnswerValue::Choice(2)), 2.0)
            .await
            .unwrap()
            .unwrap();
        h.handle
            .answer(2, Some(AnswerValue::Choice(2)), 9.0)
            .await
            .unwrap()
            .unwrap();

        let results = next_action(&mut h.inboxes[0], "question/results").await;
        assert_eq!(results["lastPlayer"], "bob");
        let entries = results["results"].as_array().unwrap();
        let alice = entries.iter().find(|e| e["pseudo"] == "alice").unwrap();
        let bob = entries.iter().find(|e| e["pseudo"] == "bob").unwrap();
        assert_eq!(alice["lives"], 3);
        assert_eq!(bob["lives"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fifty_keeps_the_correct_option_and_one_decoy() {
        let mut h = harness(config(GameMode::Solo, 0, 10), 2).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        h.handle.join(2, "bob".into()).await.unwrap().unwrap();
        h.handle.start(1).await.unwrap().unwrap();
        next_action(&mut h.inboxes[0], "question/new").await;

        let info = h.handle.joker(1, JokerKind::Fifty).await.unwrap().unwrap();
        let remaining = info.remaining_answers.unwrap();
        assert_eq!(remaining.len(), 2);
        // Correct option is always "C" in the test bank
        assert!(remaining.contains(&"C".to_string()));
        assert!(!info.fifty_left);
        assert!(info.skip_left);

        assert_eq!(
            h.handle.joker(1, JokerKind::Fifty).await.unwrap().unwrap_err(),
            JokerError::NotAvailable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn skip_counts_as_answered_and_dodges_penalties() {
        let mut h = harness(config(GameMode::Battle, 2, 10), 2).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        h.handle.join(2, "bob".into()).await.unwrap().unwrap();
        h.handle.start(1).await.unwrap().unwrap();
        next_action(&mut h.inboxes[0], "question/new").await;

        h.handle
            .answer(1, Some(AnswerValue::Choice(2)), 2.0)
            .await
            .unwrap()
            .unwrap();
        // Bob's skip completes the question: results follow immediately
        let info = h.handle.joker(2, JokerKind::Skip).await.unwrap().unwrap();
        assert!(!info.skip_left);

        let results = next_action(&mut h.inboxes[0], "question/results").await;
        let entries = results["results"].as_array().unwrap();
        let bob = entries.iter().find(|e| e["pseudo"] == "bob").unwrap();
        assert_eq!(bob["answer"], -2);
        // Skipping is penalty-exempt: bob keeps both lives
        assert_eq!(bob["lives"], 2);
        if cfg!(feature = "last-player-penalty") {
            // The skipper is never the "last player"
            assert_eq!(results["lastPlayer"], "alice");
        }

        assert_eq!(
            h.handle.joker(2, JokerKind::Skip).await.unwrap().unwrap_err(),
            JokerError::NotAvailable
        );
    }

    #[tokio::test]
    async fn leaving_reassigns_the_creator_and_empties_out() {
        let mut h = harness(config(GameMode::Solo, 0, 10), 2).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        h.handle.join(2, "bob".into()).await.unwrap().unwrap();

        h.handle.leave(1).await;
        let event = next_action(&mut h.inboxes[1], "session/player/left").await;
        assert_eq!(event["pseudo"], "alice");

        // Bob inherited the session; with one player a start is still refused
        assert_eq!(
            h.handle.start(2).await.unwrap().unwrap_err(),
            StartError::NotEnoughPlayers
        );

        h.handle.leave(2).await;
        // Last player gone: the session evaporates
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn mid_game_leave_of_last_holdout_closes_the_question() {
        let mut h = harness(config(GameMode::Solo, 0, 10), 3).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        h.handle.join(2, "bob".into()).await.unwrap().unwrap();
        h.handle.join(3, "carol".into()).await.unwrap().unwrap();
        h.handle.start(1).await.unwrap().unwrap();
        next_action(&mut h.inboxes[0], "question/new").await;

        h.handle
            .answer(1, Some(AnswerValue::Choice(2)), 2.0)
            .await
            .unwrap()
            .unwrap();
        h.handle
            .answer(2, Some(AnswerValue::Choice(2)), 3.0)
            .await
            .unwrap()
            .unwrap();
        // Carol leaves instead of answering: the question completes now
        h.handle.leave(3).await;

        let results = next_action(&mut h.inboxes[0], "question/results").await;
        assert_eq!(results["results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn solo_ranking_is_by_score() {
        let mut h = harness(config(GameMode::Solo, 0, 10), 2).await;
        h.handle.join(1, "alice".into()).await.unwrap().unwrap();
        h.handle.join(2, "bob".into()).await.unwrap().unwrap();
        h.handle.start(1).await.unwrap().unwrap();

        // Bob outscores alice on every question until the game ends
        for _ in 0..10 {
            next_action(&mut h.inboxes[1], "question/new").await;
            h.handle
                .answer(1, Some(AnswerValue::Choice(0)), 2.0)
                .await
                .unwrap()
                .unwrap();
            h.handle
                .answer(2, Some(AnswerValue::Choice(2)), 2.0)
                .await
                .unwrap()
                .unwrap();
            next_action(&mut h.inboxes[1], "question/results").await;
        }

        let finished = next_action(&mut h.inboxes[1], "session/finished").await;
        assert_eq!(finished["mode"], "solo");
        assert!(finished["winner"].is_null());
        let ranking = finished["ranking"].as_array().unwrap();
        assert_eq!(ranking[0]["pseudo"], "bob");
        assert_eq!(ranking[0]["score"], 130);
        assert_eq!(ranking[0]["correctAnswers"], 10);
        assert_eq!(ranking[1]["pseudo"], "alice");
        assert_eq!(ranking[1]["score"], 0);
    }
}
