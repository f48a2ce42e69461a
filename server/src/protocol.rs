//! The request dispatcher: routes `METHOD endpoint` requests to handlers,
//! enforces preconditions, and translates engine outcomes into responses.
//!
//! Pre-checks run in a fixed order: unknown endpoint (520), unparseable
//! POST body (400), authentication (401), session membership (400), then
//! per-field validation inside each handler (400). Every request gets
//! exactly one JSON response, errors included, and a corrupt request from
//! one client never affects another.

use crate::accounts::{RegisterOutcome, MAX_PSEUDO_LEN};
use crate::server::ServerContext;
use crate::session::{
    AnswerError, JoinError, JokerError, SessionConfig, StartError, MAX_PLAYERS_PER_SESSION,
};
use crate::session_manager::CreateError;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use shared::{
    AnswerBody, CreateSessionBody, Credentials, GameMode, JoinSessionBody, JokerBody, JokerKind,
};

/// Routes one framed request and returns the response line (without the
/// trailing newline).
pub async fn handle_request(
    ctx: &ServerContext,
    client_id: u32,
    header: &str,
    body: Option<&str>,
) -> String {
    let mut parts = header.split_whitespace();
    let (method, endpoint) = match (parts.next(), parts.next()) {
        (Some(method), Some(endpoint)) => (method, endpoint),
        _ => {
            warn!("Client {}: unparseable request line", client_id);
            return bad_request();
        }
    };
    debug!("Client {}: {} {}", client_id, method, endpoint);

    match (method, endpoint) {
        ("GET", "themes/list") => themes_list(ctx),
        ("GET", "sessions/list") => sessions_list(ctx).await,
        (
            "POST",
            "player/register" | "player/login" | "session/create" | "session/join"
            | "session/start" | "question/answer" | "joker/use",
        ) => {
            // The body line must be a JSON object, whatever the endpoint
            let Some(body) = body
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .filter(Value::is_object)
            else {
                warn!("Client {}: POST body is not a JSON object", client_id);
                return bad_request();
            };
            match endpoint {
                "player/register" => register(ctx, body).await,
                "player/login" => login(ctx, client_id, body).await,
                "session/create" => create_session(ctx, client_id, body).await,
                "session/join" => join_session(ctx, client_id, body).await,
                "session/start" => start_session(ctx, client_id).await,
                "question/answer" => answer(ctx, client_id, body).await,
                _ => joker(ctx, client_id, body).await,
            }
        }
        ("GET", _) | ("POST", _) => {
            warn!("Client {}: unknown endpoint {} {}", client_id, method, endpoint);
            unknown_error()
        }
        _ => {
            warn!("Client {}: unknown method '{}'", client_id, method);
            bad_request()
        }
    }
}

fn error_response(action: Option<&str>, statut: &str, message: &str) -> String {
    let mut response = json!({ "statut": statut, "message": message });
    if let Some(action) = action {
        response["action"] = json!(action);
    }
    response.to_string()
}

fn bad_request() -> String {
    error_response(None, "400", "Bad request")
}

fn unknown_error() -> String {
    error_response(None, "520", "Unknown Error")
}

/// Field-level validation of an already-parsed body
fn fields<T: DeserializeOwned>(body: Value) -> Option<T> {
    serde_json::from_value(body).ok()
}

/// The authenticated pseudo of a client, if it has logged in
async fn pseudo_of(ctx: &ServerContext, client_id: u32) -> Option<String> {
    ctx.clients.read().await.pseudo_of(client_id)
}

async fn session_of(ctx: &ServerContext, client_id: u32) -> Option<u32> {
    ctx.clients.read().await.session_of(client_id)
}

async fn register(ctx: &ServerContext, body: Value) -> String {
    const ACTION: &str = "player/register";
    let Some(creds) = fields::<Credentials>(body) else {
        return bad_request();
    };
    if creds.pseudo.is_empty() || creds.pseudo.len() > MAX_PSEUDO_LEN {
        return error_response(Some(ACTION), "400", "invalid pseudo");
    }

    let outcome = ctx.accounts.lock().await.register(&creds.pseudo, &creds.password);
    match outcome {
        RegisterOutcome::Ok => json!({
            "action": ACTION,
            "statut": "201",
            "message": "player registered successfully",
        })
        .to_string(),
        RegisterOutcome::Conflict => error_response(Some(ACTION), "409", "pseudo already exists"),
        RegisterOutcome::Full => error_response(Some(ACTION), "403", "account limit reached"),
    }
}

async fn login(ctx: &ServerContext, client_id: u32, body: Value) -> String {
    const ACTION: &str = "player/login";
    let Some(creds) = fields::<Credentials>(body) else {
        return bad_request();
    };

    let valid = ctx.accounts.lock().await.login(&creds.pseudo, &creds.password);
    if !valid {
        return error_response(Some(ACTION), "401", "invalid credentials");
    }

    ctx.clients
        .write()
        .await
        .set_authenticated(client_id, &creds.pseudo);
    json!({
        "action": ACTION,
        "statut": "200",
        "message": "login successful",
    })
    .to_string()
}

fn themes_list(ctx: &ServerContext) -> String {
    let themes: Vec<_> = ctx
        .bank
        .themes()
        .iter()
        .map(|t| json!({ "id": t.id, "name": t.name }))
        .collect();
    json!({
        "action": "themes/list",
        "statut": "200",
        "message": "ok",
        "nbThemes": themes.len(),
        "themes": themes,
    })
    .to_string()
}

async fn sessions_list(ctx: &ServerContext) -> String {
    // Collect handles under the lock, query each session outside it
    let handles = ctx.sessions.lock().await.live_handles();
    let mut waiting = Vec::new();
    for handle in handles {
        if let Some(summary) = handle.snapshot().await {
            if summary.status == "waiting" {
                waiting.push(summary);
            }
        }
    }

    let mut response = json!({
        "action": "sessions/list",
        "statut": "200",
        "message": "ok",
        "nbSessions": waiting.len(),
    });
    if !waiting.is_empty() {
        response["sessions"] = json!(waiting);
    }
    response.to_string()
}

async fn create_session(ctx: &ServerContext, client_id: u32, body: Value) -> String {
    const ACTION: &str = "session/create";
    let Some(pseudo) = pseudo_of(ctx, client_id).await else {
        return error_response(Some(ACTION), "401", "not authenticated");
    };
    if session_of(ctx, client_id).await.is_some() {
        return error_response(Some(ACTION), "400", "already in a session");
    }
    let Some(body) = fields::<CreateSessionBody>(body) else {
        return bad_request();
    };

    let initial_lives = match body.mode {
        GameMode::Battle => match body.lives {
            None => {
                return error_response(Some(ACTION), "400", "lives required for battle mode");
            }
            Some(lives) if !(1..=10).contains(&lives) => {
                return error_response(Some(ACTION), "400", "lives must be between 1 and 10");
            }
            Some(lives) => lives,
        },
        GameMode::Solo => 0,
    };
    if body.theme_ids.is_empty()
        || !(10..=50).contains(&body.nb_questions)
        || !(10..=60).contains(&body.time_limit)
        || !(2..=MAX_PLAYERS_PER_SESSION as u32).contains(&body.max_players)
    {
        return error_response(Some(ACTION), "400", "invalid parameters");
    }

    let cfg = SessionConfig {
        name: body.name,
        theme_ids: body.theme_ids,
        difficulty: body.difficulty,
        nb_questions: body.nb_questions as usize,
        time_limit: body.time_limit,
        mode: body.mode,
        initial_lives,
        max_players: body.max_players as usize,
    };

    let created = ctx.sessions.lock().await.create(cfg, client_id);
    let handle = match created {
        Ok(handle) => handle,
        Err(CreateError::InsufficientQuestions) => {
            return error_response(Some(ACTION), "400", "not enough questions matching criteria");
        }
        Err(CreateError::NoSlot) => {
            return error_response(Some(ACTION), "520", "no session slot available");
        }
    };

    // The creator becomes the first member before the response goes out
    match handle.join(client_id, pseudo).await {
        Some(Ok(info)) => {
            ctx.clients
                .write()
                .await
                .set_session(client_id, Some(handle.id));
            let mut response = json!({
                "action": ACTION,
                "statut": "201",
                "message": "session created",
                "sessionId": handle.id,
                "isCreator": true,
                "jokers": { "fifty": 1, "skip": 1 },
            });
            if let Some(lives) = info.lives {
                response["lives"] = json!(lives);
            }
            response.to_string()
        }
        _ => error_response(Some(ACTION), "520", "internal error"),
    }
}

async fn join_session(ctx: &ServerContext, client_id: u32, body: Value) -> String {
    const ACTION: &str = "session/join";
    let Some(pseudo) = pseudo_of(ctx, client_id).await else {
        return error_response(Some(ACTION), "401", "not authenticated");
    };
    if session_of(ctx, client_id).await.is_some() {
        return error_response(Some(ACTION), "400", "already in a session");
    }
    let Some(body) = fields::<JoinSessionBody>(body) else {
        return bad_request();
    };

    let Some(handle) = ctx.sessions.lock().await.find(body.session_id) else {
        return error_response(Some(ACTION), "404", "session not found");
    };
    match handle.join(client_id, pseudo).await {
        Some(Ok(info)) => {
            ctx.clients
                .write()
                .await
                .set_session(client_id, Some(handle.id));
            let mut response = json!({
                "action": ACTION,
                "statut": "201",
                "message": "session joined",
                "sessionId": handle.id,
                "mode": info.mode,
                "isCreator": info.is_creator,
                "players": info.players,
                "jokers": { "fifty": 1, "skip": 1 },
            });
            if let Some(lives) = info.lives {
                response["lives"] = json!(lives);
            }
            response.to_string()
        }
        Some(Err(JoinError::Full)) => error_response(Some(ACTION), "403", "session is full"),
        Some(Err(JoinError::NotWaiting)) | Some(Err(JoinError::AlreadyJoined)) | None => {
            error_response(Some(ACTION), "400", "cannot join session")
        }
    }
}

async fn start_session(ctx: &ServerContext, client_id: u32) -> String {
    const ACTION: &str = "session/start";
    if pseudo_of(ctx, client_id).await.is_none() {
        return error_response(Some(ACTION), "401", "not authenticated");
    }
    let Some(session_id) = session_of(ctx, client_id).await else {
        return error_response(Some(ACTION), "400", "not in a session");
    };
    let Some(handle) = ctx.sessions.lock().await.find(session_id) else {
        return error_response(Some(ACTION), "404", "session not found");
    };

    match handle.start(client_id).await {
        Some(Ok(())) => json!({
            "action": ACTION,
            "statut": "200",
            "message": "session starting",
        })
        .to_string(),
        Some(Err(StartError::NotCreator)) => {
            error_response(Some(ACTION), "403", "only creator can start session")
        }
        Some(Err(StartError::NotEnoughPlayers)) => {
            error_response(Some(ACTION), "400", "need at least 2 players")
        }
        Some(Err(StartError::NotWaiting)) => {
            error_response(Some(ACTION), "400", "session already started")
        }
        None => error_response(Some(ACTION), "404", "session not found"),
    }
}

async fn answer(ctx: &ServerContext, client_id: u32, body: Value) -> String {
    const ACTION: &str = "question/answer";
    if pseudo_of(ctx, client_id).await.is_none() {
        return error_response(Some(ACTION), "401", "not authenticated");
    }
    let Some(session_id) = session_of(ctx, client_id).await else {
        return error_response(Some(ACTION), "400", "not in a session");
    };
    let Some(body) = fields::<AnswerBody>(body) else {
        return bad_request();
    };
    let Some(handle) = ctx.sessions.lock().await.find(session_id) else {
        return error_response(Some(ACTION), "400", "session not playing");
    };

    match handle.answer(client_id, body.answer, body.response_time).await {
        Some(Ok(())) => json!({
            "action": ACTION,
            "statut": "200",
            "message": "answer received",
        })
        .to_string(),
        Some(Err(AnswerError::NotPlaying)) | None => {
            error_response(Some(ACTION), "400", "session not playing")
        }
    }
}

async fn joker(ctx: &ServerContext, client_id: u32, body: Value) -> String {
    const ACTION: &str = "joker/use";
    if pseudo_of(ctx, client_id).await.is_none() {
        return error_response(Some(ACTION), "401", "not authenticated");
    }
    let Some(session_id) = session_of(ctx, client_id).await else {
        return error_response(Some(ACTION), "400", "not in a session");
    };
    let Some(body) = fields::<JokerBody>(body) else {
        return bad_request();
    };
    let Some(kind) = JokerKind::parse(&body.kind) else {
        return error_response(Some(ACTION), "400", "unknown joker type");
    };
    let Some(handle) = ctx.sessions.lock().await.find(session_id) else {
        return error_response(Some(ACTION), "400", "session not playing");
    };

    match handle.joker(client_id, kind).await {
        Some(Ok(info)) => match kind {
            JokerKind::Fifty => json!({
                "action": ACTION,
                "statut": "200",
                "message": "joker activated",
                "remainingAnswers": info.remaining_answers,
                "jokers": { "fifty": 0, "skip": info.skip_left as i32 },
            })
            .to_string(),
            JokerKind::Skip => json!({
                "action": ACTION,
                "statut": "200",
                "message": "question skipped",
                "jokers": { "fifty": info.fifty_left as i32, "skip": 0 },
            })
            .to_string(),
        },
        Some(Err(JokerError::NotAvailable)) => {
            error_response(Some(ACTION), "400", "joker not available")
        }
        Some(Err(JokerError::NotMember)) => error_response(Some(ACTION), "400", "player not found"),
        Some(Err(JokerError::NotPlaying)) | None => {
            error_response(Some(ACTION), "400", "session not playing")
        }
    }
}
