//! Real-time channel: engine events out, client commands in.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::auth::AuthUser;
use super::error::error_code;
use super::AppState;
use crate::error::MatchError;
use crate::models::*;

/// Commands a client may send over the socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    StartSearch {
        match_type: MatchType,
        #[serde(default)]
        criteria: SearchCriteria,
        #[serde(default)]
        location: Option<GeoPoint>,
    },
    CancelSearch,
    RespondProposal {
        proposal_id: ProposalId,
        decision: Decision,
    },
    RequestReveal {
        match_id: MatchId,
    },
    EndMatch {
        match_id: MatchId,
    },
}

impl ClientCommand {
    fn name(&self) -> &'static str {
        match self {
            ClientCommand::StartSearch { .. } => "start_search",
            ClientCommand::CancelSearch => "cancel_search",
            ClientCommand::RespondProposal { .. } => "respond_proposal",
            ClientCommand::RequestReveal { .. } => "request_reveal",
            ClientCommand::EndMatch { .. } => "end_match",
        }
    }
}

/// Replies to client commands. Engine events are sent as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandReply {
    Ack {
        command: String,
        result: Value,
    },
    Error {
        command: Option<String>,
        code: String,
        message: String,
        retryable: bool,
    },
}

impl CommandReply {
    fn failed(command: Option<&str>, err: &MatchError) -> Self {
        CommandReply::Error {
            command: command.map(String::from),
            code: error_code(err).to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>, AuthUser(user): AuthUser) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn execute(state: &AppState, user: UserId, command: ClientCommand) -> Result<Value, MatchError> {
    let engine = &state.engine;
    match command {
        ClientCommand::StartSearch {
            match_type,
            criteria,
            location,
        } => {
            let entry = engine.start_search(user, match_type, criteria, location).await?;
            engine.schedule_matching_pass(user);
            Ok(json!({ "status": entry.status, "enqueued_at": entry.enqueued_at }))
        }
        ClientCommand::CancelSearch => {
            let outcome = engine.cancel_search(user).await?;
            Ok(json!({ "status": outcome }))
        }
        ClientCommand::RespondProposal {
            proposal_id,
            decision,
        } => {
            let outcome = engine.respond_proposal(user, proposal_id, decision).await?;
            for released in outcome.requeued {
                engine.schedule_matching_pass(released);
            }
            Ok(json!({ "proposal_id": proposal_id, "status": outcome.status }))
        }
        ClientCommand::RequestReveal { match_id } => {
            let status = engine.request_reveal(user, match_id).await?;
            Ok(json!({ "match_id": match_id, "status": status }))
        }
        ClientCommand::EndMatch { match_id } => {
            engine.end_match(user, match_id).await?;
            Ok(json!({ "match_id": match_id, "status": MatchStatus::Ended }))
        }
    }
}

async fn reply_to(state: &AppState, user: UserId, text: &str) -> CommandReply {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            return CommandReply::failed(None, &MatchError::Validation(format!("unreadable command: {}", e)));
        }
    };
    let name = command.name();
    match execute(state, user, command).await {
        Ok(result) => CommandReply::Ack {
            command: name.to_string(),
            result,
        },
        Err(e) => {
            debug!(%user, command = name, "command rejected: {}", e);
            CommandReply::failed(Some(name), &e)
        }
    }
}

fn frame<T: Serialize>(value: &T) -> Option<Message> {
    match serde_json::to_string(value) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!("failed to encode frame: {}", e);
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let dispatcher = state.engine.dispatcher().clone();

    let (channel_id, mut events) = match dispatcher.register_connection(user).await {
        Ok(registered) => registered,
        Err(e) => {
            warn!(%user, "could not register connection: {}", e);
            if let Some(msg) = frame(&CommandReply::failed(None, &e)) {
                let _ = sender.send(msg).await;
            }
            let _ = sender.close().await;
            return;
        }
    };
    info!(%user, %channel_id, "🔌 WebSocket connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(msg) = frame(&event) else { continue };
                if sender.send(msg).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = reply_to(&state, user, text.as_str()).await;
                        if let Some(msg) = frame(&reply) {
                            if sender.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%user, "socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = dispatcher.unregister_connection(channel_id).await {
        warn!(%user, %channel_id, "failed to unregister connection: {}", e);
    }
    info!(%user, %channel_id, "WebSocket disconnected");
}
