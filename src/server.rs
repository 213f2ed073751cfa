use actix_web::{web, HttpRequest, HttpResponse};
use jsonwebtoken::DecodingKey;
use mongodb::bson::oid::ObjectId;
use serde::Deserialize;
use serde_json::json;

use crate::chat_server::ChatServerHandle;
use crate::db::{MongoStore, RoomStore};
use crate::error::ChatError;
use crate::types::UserRef;
use crate::utils::{get_access_token_from_auth_header, get_user_details, Claims};

pub fn rest_scope(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/chat")
            .route("/chats", web::get().to(list_chats))
            .route("/create", web::post().to(create_chat))
            .route("/sendMessage", web::post().to(send_message))
            .route("/{id}", web::delete().to(delete_chat)),
    );
}

fn authenticate(req: &HttpRequest, key: &DecodingKey) -> Result<Claims, HttpResponse> {
    let token = match get_access_token_from_auth_header(req.clone()) {
        Some(token) => token,
        None => {
            return Err(HttpResponse::Unauthorized().body("No authorization token provided"));
        }
    };

    get_user_details(&token, key)
        .map_err(|_| HttpResponse::Unauthorized().body("Invalid token"))
}

#[derive(Deserialize)]
struct ListChatsQuery {
    username: Option<String>,
}

async fn list_chats(
    req: HttpRequest,
    query: web::Query<ListChatsQuery>,
    store: web::Data<MongoStore>,
    verifying_key: web::Data<DecodingKey>,
) -> Result<HttpResponse, ChatError> {
    let caller = match authenticate(&req, verifying_key.get_ref()) {
        Ok(caller) => caller,
        Err(response) => return Ok(response),
    };

    let username = query.into_inner().username.unwrap_or(caller.username);
    let chats = store.rooms_for_user(&username).await?;

    Ok(HttpResponse::Ok().json(json!({ "chats": chats })))
}

#[derive(Deserialize)]
struct CreateChatRequest {
    participants: Vec<UserRef>,
}

async fn create_chat(
    req: HttpRequest,
    body: web::Json<CreateChatRequest>,
    store: web::Data<MongoStore>,
    verifying_key: web::Data<DecodingKey>,
) -> Result<HttpResponse, ChatError> {
    if let Err(response) = authenticate(&req, verifying_key.get_ref()) {
        return Ok(response);
    }

    let chat = store.create_room(body.into_inner().participants).await?;

    Ok(HttpResponse::Ok().json(json!({ "chat": chat })))
}

#[derive(Deserialize)]
struct SendMessageRequest {
    room_id: String,
    content: String,
}

async fn send_message(
    req: HttpRequest,
    body: web::Json<SendMessageRequest>,
    store: web::Data<MongoStore>,
    chat_handle: web::Data<ChatServerHandle>,
    verifying_key: web::Data<DecodingKey>,
) -> Result<HttpResponse, ChatError> {
    let caller = match authenticate(&req, verifying_key.get_ref()) {
        Ok(caller) => caller,
        Err(response) => return Ok(response),
    };

    let body = body.into_inner();
    let room_id = parse_chat_id(&body.room_id)?;
    ensure_participant(store.room(&room_id).await?, &caller)?;

    // Routed through the coordinator so persistence commits before the
    // broadcast and ordering matches the socket path.
    let chat = chat_handle
        .send_to_room(room_id, caller.username, body.content)
        .await?;

    Ok(HttpResponse::Ok().json(json!({ "chat": chat })))
}

async fn delete_chat(
    req: HttpRequest,
    path: web::Path<String>,
    store: web::Data<MongoStore>,
    chat_handle: web::Data<ChatServerHandle>,
    verifying_key: web::Data<DecodingKey>,
) -> Result<HttpResponse, ChatError> {
    let caller = match authenticate(&req, verifying_key.get_ref()) {
        Ok(caller) => caller,
        Err(response) => return Ok(response),
    };

    let id = parse_chat_id(&path.into_inner())?;

    // Hard delete, then evict any live subscribers of the dead room. Only
    // a participant may delete.
    let room = ensure_participant(store.room(&id).await?, &caller)?;
    store.delete_room(&id).await?;
    chat_handle.room_deleted(room.room_name)?;

    let chats = store.rooms_for_user(&caller.username).await?;
    Ok(HttpResponse::Ok().json(json!({ "chats": chats })))
}

fn parse_chat_id(raw: &str) -> Result<ObjectId, ChatError> {
    ObjectId::parse_str(raw)
        .map_err(|_| ChatError::Validation(format!("'{raw}' is not a valid chat id")))
}

/// Non-participants get the same answer as an unknown id, so room ids leak
/// nothing about other users' chats.
fn ensure_participant(
    room: crate::types::ChatRoom,
    caller: &Claims,
) -> Result<crate::types::ChatRoom, ChatError> {
    if !room.has_participant(&caller.id) {
        return Err(ChatError::NotFound(format!(
            "no chat room with id {}",
            room.id
        )));
    }
    Ok(room)
}
