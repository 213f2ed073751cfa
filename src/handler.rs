use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_ws::{Message as WsMessage, MessageStream, Session};
use futures::{FutureExt, StreamExt};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::{
    sync::{mpsc, oneshot},
    time::interval,
};

use crate::chat_server::ChatServerHandle;
use crate::error::ChatError;
use crate::gateway::{ConnId, Outbound};
use crate::utils::{get_access_token_from_auth_header, get_user_details};

// WebSocket connection constants
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize, Deserialize)]
struct WebSocketMessage {
    #[serde(default)]
    message_type: String,
    #[serde(flatten)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct JoinRoomRequest {
    room_id: String,
}

#[derive(Deserialize)]
struct SendMessageRequest {
    content: String,
}

fn envelope(message_type: &str, data: serde_json::Value) -> String {
    serde_json::to_string(&WebSocketMessage {
        message_type: message_type.to_string(),
        data,
    })
    .unwrap_or_else(|_| String::from("{\"message_type\":\"error\"}"))
}

fn error_envelope(err: &ChatError) -> String {
    envelope("error", json!({ "message": err.to_string() }))
}

// WebSocket connection handler endpoint
pub async fn ws_connect(
    req: HttpRequest,
    body: web::Payload,
    chat_handle: web::Data<ChatServerHandle>,
    verifying_key: web::Data<jsonwebtoken::DecodingKey>,
) -> Result<HttpResponse, Error> {
    // Extract and verify token
    let token = match get_access_token_from_auth_header(req.clone()) {
        Some(token) => token,
        None => return Ok(HttpResponse::Unauthorized().body("No authorization token provided")),
    };

    let user = match get_user_details(&token, verifying_key.get_ref()) {
        Ok(user) => user,
        Err(_) => return Ok(HttpResponse::Unauthorized().body("Invalid token")),
    };

    let (response, session, msg_stream) = actix_ws::handle(&req, body)?;

    let conn_id = ConnId::new();
    actix_web::rt::spawn(websocket_handler(
        session,
        msg_stream,
        chat_handle.get_ref().clone(),
        conn_id,
        user.username,
    ));

    Ok(response)
}

// Main WebSocket handler function
async fn websocket_handler(
    mut session: Session,
    mut msg_stream: MessageStream,
    chat_handle: ChatServerHandle,
    conn_id: ConnId,
    username: String,
) {
    // Channel the coordinator fans broadcasts out on
    let (msg_tx, mut msg_rx) = mpsc::channel::<Outbound>(100);

    match chat_handle.connect(conn_id, username.clone(), msg_tx) {
        Ok(_) => log::debug!("User {} connected as {}", username, conn_id),
        Err(e) => {
            log::error!("Failed to register connection: {}", e);
            let _ = session
                .close(Some(actix_ws::CloseReason {
                    code: actix_ws::CloseCode::Error,
                    description: Some(e.to_string()),
                }))
                .await;
            return;
        }
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut shutdown_rx = shutdown_rx.fuse();

    let mut heartbeat_interval = interval(HEARTBEAT_INTERVAL);

    let last_heartbeat = Arc::new(Mutex::new(Instant::now()));
    let last_heartbeat_clone = Arc::clone(&last_heartbeat);

    // Task forwarding coordinator broadcasts to the WebSocket
    let chat_to_ws = {
        let mut session = session.clone();

        async move {
            loop {
                tokio::select! {
                    Some(event) = msg_rx.recv() => {
                        let json = match event {
                            Outbound::Message(msg) => match serde_json::to_value(&msg) {
                                Ok(value) => envelope("message", value),
                                Err(_) => continue,
                            },
                            Outbound::RoomDeleted { room } => {
                                envelope("roomDeleted", json!({ "room": room }))
                            }
                        };

                        if session.text(json).await.is_err() {
                            break;
                        }
                    }

                    // Heartbeat tick
                    _ = heartbeat_interval.tick() => {
                        if Instant::now().duration_since(*last_heartbeat.lock().unwrap()) > CLIENT_TIMEOUT {
                            log::info!("Client heartbeat timeout, disconnecting {}", conn_id);
                            let _ = session.close(None).await;
                            break;
                        }

                        if session.ping(b"").await.is_err() {
                            break;
                        }
                    }

                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
        }
    };

    let chat_task = tokio::spawn(chat_to_ws);

    // Process incoming WebSocket messages
    while let Some(msg) = msg_stream.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                let Ok(ws_message) = serde_json::from_str::<WebSocketMessage>(&text) else {
                    continue;
                };

                match ws_message.message_type.as_str() {
                    "joinRoom" => {
                        let reply = match serde_json::from_value::<JoinRoomRequest>(ws_message.data)
                        {
                            Ok(join) => match parse_room_id(&join.room_id) {
                                Ok(room_id) => match chat_handle.join(conn_id, room_id).await {
                                    Ok(room) => envelope("joined", json!({ "room": room })),
                                    Err(e) => error_envelope(&e),
                                },
                                Err(e) => error_envelope(&e),
                            },
                            Err(_) => error_envelope(&ChatError::Validation(
                                "joinRoom requires a room_id".into(),
                            )),
                        };

                        if session.text(reply).await.is_err() {
                            break;
                        }
                    }
                    "leaveRoom" => {
                        let reply = match chat_handle.leave(conn_id) {
                            Ok(_) => envelope("left", json!({})),
                            Err(e) => error_envelope(&e),
                        };

                        if session.text(reply).await.is_err() {
                            break;
                        }
                    }
                    "sendMessage" => {
                        let reply =
                            match serde_json::from_value::<SendMessageRequest>(ws_message.data) {
                                Ok(send) => match chat_handle.send(conn_id, send.content).await {
                                    // The synchronous reply carries the full
                                    // updated history; the broadcast echo is
                                    // delivered separately.
                                    Ok(messages) => {
                                        envelope("history", json!({ "messages": messages }))
                                    }
                                    Err(e) => error_envelope(&e),
                                },
                                Err(_) => error_envelope(&ChatError::Validation(
                                    "sendMessage requires content".into(),
                                )),
                            };

                        if session.text(reply).await.is_err() {
                            break;
                        }
                    }
                    "ping" => {
                        if session.text(envelope("pong", json!({}))).await.is_err() {
                            break;
                        }
                    }
                    _ => {
                        let reply = error_envelope(&ChatError::Validation(
                            "unknown message type".into(),
                        ));
                        if session.text(reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(WsMessage::Ping(bytes)) => {
                let mut last_heartbeat = last_heartbeat_clone.lock().unwrap();
                *last_heartbeat = Instant::now();
                if session.pong(&bytes).await.is_err() {
                    break;
                }
            }
            Ok(WsMessage::Pong(_)) => {
                let mut last_heartbeat = last_heartbeat_clone.lock().unwrap();
                *last_heartbeat = Instant::now();
            }
            Ok(WsMessage::Close(reason)) => {
                let _ = session.close(reason).await;
                break;
            }
            Ok(WsMessage::Binary(_)) => {
                // Text protocol only
            }
            Ok(WsMessage::Continuation(_)) => {}
            Ok(WsMessage::Nop) => {}
            Err(e) => {
                log::warn!("Error receiving message: {:?}", e);
                break;
            }
        }
    }

    let _ = shutdown_tx.send(());

    let _ = chat_task.await;

    // Implicit leave; the subscription is ephemeral by design and history
    // is re-fetched on reconnect.
    let _ = chat_handle.disconnect(conn_id);

    log::debug!("WebSocket connection closed for {}", username);
}

fn parse_room_id(raw: &str) -> Result<ObjectId, ChatError> {
    ObjectId::parse_str(raw)
        .map_err(|_| ChatError::Validation(format!("'{raw}' is not a valid room id")))
}
