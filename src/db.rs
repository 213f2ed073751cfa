use std::io::{Error, ErrorKind};

use futures::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, to_bson};
use mongodb::options::ReturnDocument;
use mongodb::{Client, Collection};

use crate::error::ChatError;
use crate::types::{ChatRoom, Message, UserRef};

/// Durable room registry and message store.
///
/// Appends must serialize per room (the coordinator relies on this to keep
/// histories loss-free under concurrent sends); unrelated rooms may proceed
/// independently.
pub trait RoomStore: Send + Sync + 'static {
    /// Creates the room for a participant pair, or returns the existing one.
    /// Pair identity is the canonical `pair_key`, never the display name.
    async fn create_room(&self, participants: Vec<UserRef>) -> Result<ChatRoom, ChatError>;

    async fn room(&self, id: &ObjectId) -> Result<ChatRoom, ChatError>;

    /// Exact membership query on `participants.username`. Substring matching
    /// against the room name would false-positive on prefix usernames.
    async fn rooms_for_user(&self, username: &str) -> Result<Vec<ChatRoom>, ChatError>;

    async fn delete_room(&self, id: &ObjectId) -> Result<(), ChatError>;

    /// Appends one message atomically and returns the updated room.
    async fn append_message(&self, id: &ObjectId, message: Message) -> Result<ChatRoom, ChatError>;

    async fn history(&self, id: &ObjectId) -> Result<Vec<Message>, ChatError> {
        Ok(self.room(id).await?.messages)
    }
}

pub async fn get_db_client() -> std::io::Result<Client> {
    let uri = std::env::var("MONGODB_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());

    Client::with_uri_str(&uri)
        .await
        .map_err(|err| Error::new(ErrorKind::Other, err.to_string()))
}

#[derive(Clone)]
pub struct MongoStore {
    client: Client,
}

impl MongoStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn chats(&self) -> Collection<ChatRoom> {
        self.client.database("public").collection("chats")
    }
}

impl RoomStore for MongoStore {
    async fn create_room(&self, participants: Vec<UserRef>) -> Result<ChatRoom, ChatError> {
        let room = ChatRoom::new(participants)?;

        if let Some(existing) = self
            .chats()
            .find_one(doc! { "pair_key": &room.pair_key })
            .await?
        {
            return Ok(existing);
        }

        self.chats().insert_one(&room).await?;
        Ok(room)
    }

    async fn room(&self, id: &ObjectId) -> Result<ChatRoom, ChatError> {
        self.chats()
            .find_one(doc! { "_id": id })
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("no chat room with id {id}")))
    }

    async fn rooms_for_user(&self, username: &str) -> Result<Vec<ChatRoom>, ChatError> {
        let cursor = self
            .chats()
            .find(doc! { "participants.username": username })
            .await?;

        Ok(cursor.try_collect().await?)
    }

    async fn delete_room(&self, id: &ObjectId) -> Result<(), ChatError> {
        let result = self.chats().delete_one(doc! { "_id": id }).await?;
        if result.deleted_count == 0 {
            return Err(ChatError::NotFound(format!("no chat room with id {id}")));
        }
        Ok(())
    }

    async fn append_message(&self, id: &ObjectId, message: Message) -> Result<ChatRoom, ChatError> {
        // Single atomic read-modify-write on the room document; this is the
        // per-room serialization point for concurrent appends.
        self.chats()
            .find_one_and_update(
                doc! { "_id": id },
                doc! { "$push": { "messages": to_bson(&message)? } },
            )
            .return_document(ReturnDocument::After)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("no chat room with id {id}")))
    }
}
