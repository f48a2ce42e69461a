//! # QuizNet Game Server Library
//!
//! This library implements the server side of the QuizNet multiplayer quiz
//! game: a line-framed JSON request/response protocol over TCP, concurrent
//! game sessions with time-driven question rounds, and a UDP responder that
//! advertises the server to LAN clients.
//!
//! ## Architecture
//!
//! ### One task per connection
//! Each accepted TCP connection is served by a single tokio task that owns
//! both halves of the socket. The task interleaves line reads with drains of
//! a bounded outbound queue, so a request's response and an asynchronous
//! broadcast can never interleave mid-line on the wire.
//!
//! ### One actor per session
//! Every game session runs as a dedicated task owning all of its state.
//! Joins, leaves, starts, answers and joker requests arrive through a single
//! mpsc inbox; the countdown, question timeout and inter-question pause are
//! timer arms on the same `select!` loop. The per-session state machine is
//! therefore linearizable by construction — there is no session lock, and
//! ending a session cancels its pending timers by simply dropping the task.
//!
//! ### Shared state
//! The remaining shared state is narrow: the client table (connection
//! registry and per-client send queues), the session table (actor handles),
//! and the account store. A slow client's queue filling up disconnects that
//! client rather than stalling the session that is broadcasting to it.
//!
//! ## Module Organization
//!
//! - [`server`] — TCP listener, per-connection read loop, line framing,
//!   disconnect cleanup and graceful shutdown.
//! - [`client_manager`] — bounded client table with per-client outbound
//!   queues and authentication/session bookkeeping.
//! - [`protocol`] — the request dispatcher: routing, precondition checks,
//!   response building.
//! - [`session`] — the session engine actor: lifecycle, timing, scoring,
//!   jokers, elimination, ranking, broadcast.
//! - [`session_manager`] — the session table: slot allocation, question
//!   selection at creation, lookup, listing.
//! - [`accounts`] — persistent player accounts with salted password hashes.
//! - [`question_bank`] — immutable question/theme storage, filtered random
//!   selection, answer checking and scoring.
//! - [`discover`] — the UDP discovery responder.
//! - [`text`] — accent-insensitive text-answer comparison.

pub mod accounts;
pub mod client_manager;
pub mod discover;
pub mod protocol;
pub mod question_bank;
pub mod server;
pub mod session;
pub mod session_manager;
pub mod text;
