//! The session table: slot allocation, question selection at creation time,
//! lookup by id, and listing.
//!
//! A slot is free when it has never been used or when its session task has
//! finished (the inbox of a finished session is closed, which doubles as the
//! tombstone marker). Session ids are monotonic and never reused even when
//! slots are.

use crate::client_manager::ClientManager;
use crate::question_bank::QuestionBank;
use crate::session::{self, SessionConfig, SessionHandle};
use log::info;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Maximum concurrent game sessions
pub const MAX_SESSIONS: usize = 20;

/// Why a session could not be created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    /// Fewer matching questions in the bank than the session asked for
    InsufficientQuestions,
    /// All session slots are occupied by live sessions
    NoSlot,
}

/// Owner of every session handle
pub struct SessionManager {
    slots: Vec<Option<SessionHandle>>,
    next_session_id: u32,
    clients: Arc<RwLock<ClientManager>>,
    bank: Arc<QuestionBank>,
}

impl SessionManager {
    pub fn new(clients: Arc<RwLock<ClientManager>>, bank: Arc<QuestionBank>) -> Self {
        Self {
            slots: (0..MAX_SESSIONS).map(|_| None).collect(),
            next_session_id: 1,
            clients,
            bank,
        }
    }

    /// Creates a session: picks a free slot, selects its questions, spawns
    /// the session task. The creator is not joined here.
    pub fn create(&mut self, cfg: SessionConfig, creator: u32) -> Result<SessionHandle, CreateError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.as_ref().map_or(true, |h| h.is_closed()))
            .ok_or(CreateError::NoSlot)?;

        let question_ids = self
            .bank
            .select(&cfg.theme_ids, cfg.difficulty, cfg.nb_questions)
            .map_err(|_| CreateError::InsufficientQuestions)?;

        let id = self.next_session_id;
        self.next_session_id += 1;

        let handle = session::spawn(
            id,
            cfg,
            question_ids,
            creator,
            self.clients.clone(),
            self.bank.clone(),
        );
        info!("Session {} created in slot {} by client {}", id, slot, creator);
        self.slots[slot] = Some(handle.clone());
        Ok(handle)
    }

    /// Looks a session up by id. Finished sessions are still found while
    /// their slot has not been reused; callers observe the closed inbox.
    pub fn find(&self, id: u32) -> Option<SessionHandle> {
        self.slots
            .iter()
            .flatten()
            .find(|h| h.id == id)
            .cloned()
    }

    /// Handles of all sessions whose task is still running.
    pub fn live_handles(&self) -> Vec<SessionHandle> {
        self.slots
            .iter()
            .flatten()
            .filter(|h| !h.is_closed())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::question_bank::{Question, QuestionBody, Theme};
    use shared::{Difficulty, GameMode};

    fn bank() -> Arc<QuestionBank> {
        let themes = vec![Theme { id: 0, name: "general".into() }];
        let questions = (1..=15)
            .map(|id| Question {
                id,
                theme_ids: vec![0],
                difficulty: Difficulty::Easy,
                prompt: format!("q{}", id),
                body: QuestionBody::Boolean { correct: true },
                explanation: None,
            })
            .collect();
        Arc::new(QuestionBank::from_parts(themes, questions))
    }

    fn cfg() -> SessionConfig {
        SessionConfig {
            name: "lobby".into(),
            theme_ids: vec![0],
            difficulty: Difficulty::Easy,
            nb_questions: 10,
            time_limit: 20,
            mode: GameMode::Solo,
            initial_lives: 0,
            max_players: 4,
        }
    }

    fn manager() -> SessionManager {
        let clients = Arc::new(RwLock::new(ClientManager::new(8)));
        SessionManager::new(clients, bank())
    }

    #[tokio::test]
    async fn create_assigns_monotonic_ids() {
        let mut manager = manager();
        let a = manager.create(cfg(), 1).unwrap();
        let b = manager.create(cfg(), 2).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(manager.live_handles().len(), 2);
    }

    #[tokio::test]
    async fn create_fails_on_insufficient_questions() {
        let mut manager = manager();
        let mut wanted = cfg();
        wanted.difficulty = Difficulty::Hard; // bank has none
        assert_eq!(
            manager.create(wanted, 1).unwrap_err(),
            CreateError::InsufficientQuestions
        );
        // The failed create burned no slot and no id
        let next = manager.create(cfg(), 1).unwrap();
        assert_eq!(next.id, 1);
    }

    #[tokio::test]
    async fn slots_cap_concurrent_sessions_and_are_reclaimed() {
        let mut manager = manager();
        let mut handles = Vec::new();
        for i in 0..MAX_SESSIONS {
            handles.push(manager.create(cfg(), i as u32).unwrap());
        }
        assert_eq!(manager.create(cfg(), 99).unwrap_err(), CreateError::NoSlot);

        // Empty a session out; its task exits and frees the slot
        let first = handles[0].clone();
        first.join(1, "alice".into()).await.unwrap().unwrap();
        first.leave(1).await;
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !first.is_closed() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let reused = manager.create(cfg(), 99).unwrap();
        assert_eq!(reused.id, MAX_SESSIONS as u32 + 1);
    }

    #[tokio::test]
    async fn find_locates_sessions_by_id() {
        let mut manager = manager();
        let created = manager.create(cfg(), 1).unwrap();
        assert_eq!(manager.find(created.id).unwrap().id, created.id);
        assert!(manager.find(999).is_none());
    }
}
