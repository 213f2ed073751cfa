use std::collections::HashMap;

use chrono::Local;
use mongodb::bson::oid::ObjectId;
use tokio::io;
use tokio::sync::{mpsc, oneshot};

use crate::db::RoomStore;
use crate::error::ChatError;
use crate::gateway::{ConnId, Gateway, Outbound};
use crate::types::{ChatRoom, Message};

/// The room a connection is currently joined to.
struct JoinedRoom {
    id: ObjectId,
    key: String,
}

enum Command {
    Connect {
        conn_id: ConnId,
        username: String,
        message_tx: mpsc::Sender<Outbound>,
    },
    Disconnect {
        conn_id: ConnId,
    },
    Join {
        conn_id: ConnId,
        room_id: ObjectId,
        res_tx: oneshot::Sender<Result<String, ChatError>>,
    },
    Leave {
        conn_id: ConnId,
    },
    Send {
        conn_id: ConnId,
        content: String,
        res_tx: oneshot::Sender<Result<Vec<Message>, ChatError>>,
    },
    SendToRoom {
        room_id: ObjectId,
        author: String,
        content: String,
        res_tx: oneshot::Sender<Result<ChatRoom, ChatError>>,
    },
    RoomDeleted {
        room_key: String,
    },
}

/// Chat session coordinator.
///
/// One task owns the gateway map and the per-connection join state, driven
/// by commands from cloneable handles. Durable work is awaited inline, so
/// persist-then-broadcast pairs for the same room are totally ordered and a
/// subscriber never observes a message out of commit order.
pub struct ChatServer {
    gateway: Gateway,
    usernames: HashMap<ConnId, String>,
    joined: HashMap<ConnId, JoinedRoom>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl ChatServer {
    pub fn new() -> (Self, ChatServerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();

        (
            Self {
                gateway: Gateway::new(),
                usernames: HashMap::new(),
                joined: HashMap::new(),
                cmd_rx,
            },
            ChatServerHandle { cmd_tx },
        )
    }

    pub async fn run<S: RoomStore>(mut self, store: S) -> io::Result<()> {
        while let Some(command) = self.cmd_rx.recv().await {
            match command {
                Command::Connect {
                    conn_id,
                    username,
                    message_tx,
                } => {
                    log::debug!("Connection {} opened for {}", conn_id, username);
                    self.gateway.register(conn_id, message_tx);
                    self.usernames.insert(conn_id, username);
                }
                Command::Disconnect { conn_id } => {
                    log::debug!("Connection {} closed", conn_id);
                    self.joined.remove(&conn_id);
                    self.usernames.remove(&conn_id);
                    self.gateway.unregister(conn_id);
                }
                Command::Join {
                    conn_id,
                    room_id,
                    res_tx,
                } => {
                    let _ = res_tx.send(self.handle_join(&store, conn_id, room_id).await);
                }
                Command::Leave { conn_id } => {
                    if let Some(joined) = self.joined.remove(&conn_id) {
                        self.gateway.unsubscribe(conn_id, &joined.key);
                    }
                }
                Command::Send {
                    conn_id,
                    content,
                    res_tx,
                } => {
                    let _ = res_tx.send(self.handle_send(&store, conn_id, content).await);
                }
                Command::SendToRoom {
                    room_id,
                    author,
                    content,
                    res_tx,
                } => {
                    let _ = res_tx.send(
                        self.handle_send_to_room(&store, room_id, author, content)
                            .await,
                    );
                }
                Command::RoomDeleted { room_key } => {
                    for conn_id in self.gateway.drop_group(&room_key).await {
                        self.joined.remove(&conn_id);
                    }
                }
            }
        }

        Ok(())
    }

    /// `Unjoined → Joined`. A connection already in a room must leave first;
    /// the attempt is rejected rather than silently overriding the old
    /// subscription.
    async fn handle_join<S: RoomStore>(
        &mut self,
        store: &S,
        conn_id: ConnId,
        room_id: ObjectId,
    ) -> Result<String, ChatError> {
        if let Some(current) = self.joined.get(&conn_id) {
            log::warn!(
                "Connection {} tried to join {} while joined to {}",
                conn_id,
                room_id,
                current.key
            );
            return Err(ChatError::InvalidState(
                "already joined to a room; leave it first".into(),
            ));
        }

        let room = store.room(&room_id).await?;
        self.gateway.subscribe(conn_id, &room.room_name);
        self.joined.insert(
            conn_id,
            JoinedRoom {
                id: room_id,
                key: room.room_name.clone(),
            },
        );

        Ok(room.room_name)
    }

    /// Persist first, broadcast second. A crash between the two leaves the
    /// message durable but undelivered, never the other way around.
    async fn handle_send<S: RoomStore>(
        &mut self,
        store: &S,
        conn_id: ConnId,
        content: String,
    ) -> Result<Vec<Message>, ChatError> {
        let Some(joined) = self.joined.get(&conn_id) else {
            return Err(ChatError::InvalidState(
                "cannot send before joining a room".into(),
            ));
        };
        let author = self
            .usernames
            .get(&conn_id)
            .cloned()
            .ok_or_else(|| ChatError::InvalidState("unknown connection".into()))?;

        let message = build_message(&joined.key, &author, &content)?;
        let room_id = joined.id;
        let room_key = joined.key.clone();

        let updated = store.append_message(&room_id, message.clone()).await?;
        self.gateway
            .broadcast(&room_key, Outbound::Message(message))
            .await;

        Ok(updated.messages)
    }

    /// The REST send path. Same persist-then-broadcast steps, routed through
    /// this loop so ordering matches the socket path.
    async fn handle_send_to_room<S: RoomStore>(
        &mut self,
        store: &S,
        room_id: ObjectId,
        author: String,
        content: String,
    ) -> Result<ChatRoom, ChatError> {
        let room = store.room(&room_id).await?;
        let message = build_message(&room.room_name, &author, &content)?;

        let updated = store.append_message(&room_id, message.clone()).await?;
        self.gateway
            .broadcast(&room.room_name, Outbound::Message(message))
            .await;

        Ok(updated)
    }
}

fn build_message(room_key: &str, author: &str, content: &str) -> Result<Message, ChatError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ChatError::Validation("message content must not be empty".into()));
    }

    Ok(Message {
        room: room_key.to_string(),
        author: author.to_string(),
        content: content.to_string(),
        // Captured server-side at persist time; sub-day precision only.
        timestamp: Local::now().format("%H:%M").to_string(),
    })
}

#[derive(Clone)]
pub struct ChatServerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ChatServerHandle {
    pub fn connect(
        &self,
        conn_id: ConnId,
        username: String,
        message_tx: mpsc::Sender<Outbound>,
    ) -> Result<(), ChatError> {
        self.cmd_tx
            .send(Command::Connect {
                conn_id,
                username,
                message_tx,
            })
            .map_err(|_| server_gone())
    }

    pub fn disconnect(&self, conn_id: ConnId) -> Result<(), ChatError> {
        self.cmd_tx
            .send(Command::Disconnect { conn_id })
            .map_err(|_| server_gone())
    }

    /// Returns the joined room's broadcast key.
    pub async fn join(&self, conn_id: ConnId, room_id: ObjectId) -> Result<String, ChatError> {
        let (res_tx, res_rx) = oneshot::channel();

        self.cmd_tx
            .send(Command::Join {
                conn_id,
                room_id,
                res_tx,
            })
            .map_err(|_| server_gone())?;

        res_rx.await.map_err(|_| server_gone())?
    }

    pub fn leave(&self, conn_id: ConnId) -> Result<(), ChatError> {
        self.cmd_tx
            .send(Command::Leave { conn_id })
            .map_err(|_| server_gone())
    }

    /// Returns the updated full history to the sender, independent of the
    /// broadcast, so the sender's view survives delivery gaps.
    pub async fn send(&self, conn_id: ConnId, content: String) -> Result<Vec<Message>, ChatError> {
        let (res_tx, res_rx) = oneshot::channel();

        self.cmd_tx
            .send(Command::Send {
                conn_id,
                content,
                res_tx,
            })
            .map_err(|_| server_gone())?;

        res_rx.await.map_err(|_| server_gone())?
    }

    pub async fn send_to_room(
        &self,
        room_id: ObjectId,
        author: String,
        content: String,
    ) -> Result<ChatRoom, ChatError> {
        let (res_tx, res_rx) = oneshot::channel();

        self.cmd_tx
            .send(Command::SendToRoom {
                room_id,
                author,
                content,
                res_tx,
            })
            .map_err(|_| server_gone())?;

        res_rx.await.map_err(|_| server_gone())?
    }

    pub fn room_deleted(&self, room_key: String) -> Result<(), ChatError> {
        self.cmd_tx
            .send(Command::RoomDeleted { room_key })
            .map_err(|_| server_gone())
    }
}

fn server_gone() -> ChatError {
    ChatError::Storage("chat server task stopped".into())
}
