use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use rodnya_db::models::{MessageRow, NewMessage, UserRow};
use rodnya_types::events::{ClientCommand, ServerEvent};
use rodnya_types::models::{
    ChatMessage, GENERAL, MessageKind, READ_STATUS_DELIVERED, READ_STATUS_STORED, UserProfile,
};

use crate::{SharedState, auth};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Chat history is capped to the most recent messages.
const HISTORY_LIMIT: u32 = 100;

type WsSender = SplitSink<WebSocket, Message>;
type Reply = mpsc::UnboundedSender<ServerEvent>;

/// Handle a freshly upgraded WebSocket connection.
///
/// The socket starts unauthenticated: only `register` and `login` are
/// honored until a login succeeds, everything else is dropped with a log
/// line. Credentials are re-sent on every login; there is no token scheme.
pub async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();

    let username = match wait_for_login(&mut sender, &mut receiver, &state).await {
        Some(username) => username,
        None => return,
    };

    info!("{} logged in", username);
    run_connection_loop(sender, receiver, state, username).await;
}

/// Pre-login phase: answer `register` / `login` until one login succeeds.
async fn wait_for_login(
    sender: &mut WsSender,
    receiver: &mut SplitStream<WebSocket>,
    state: &SharedState,
) -> Option<String> {
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            _ => continue,
        };

        let cmd = match serde_json::from_str::<ClientCommand>(&text) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("bad command before login: {}", e);
                continue;
            }
        };

        match cmd {
            ClientCommand::Register { username, password } => {
                let response = auth::register(&state.db, &username, &password);
                if !send_event(sender, &response).await {
                    return None;
                }
            }
            ClientCommand::Login { username, password } => {
                match auth::login(&state.db, &username, &password) {
                    Ok(user) => {
                        let ok = send_event(
                            sender,
                            &ServerEvent::LoginResponse {
                                success: true,
                                message: "Login successful".to_string(),
                            },
                        )
                        .await;
                        if !ok {
                            return None;
                        }
                        return Some(user.username);
                    }
                    Err(message) => {
                        let ok = send_event(
                            sender,
                            &ServerEvent::LoginResponse { success: false, message },
                        )
                        .await;
                        if !ok {
                            return None;
                        }
                    }
                }
            }
            other => {
                warn!("command before login ignored: {:?}", command_name(&other));
            }
        }
    }

    None
}

/// Post-login connection loop: presence registration, initial snapshot,
/// then fan-in/fan-out until the socket dies.
async fn run_connection_loop(
    mut sender: WsSender,
    mut receiver: SplitStream<WebSocket>,
    state: SharedState,
    username: String,
) {
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let conn_id = state.dispatcher.register(&username, conn_tx.clone()).await;

    if let Err(e) = state.db.touch_last_online(&username, &Utc::now().to_rfc3339()) {
        warn!("{}: failed to update last_online: {}", username, e);
    }

    // Initial snapshot for this socket: user list + general history.
    match load_users_list(&state) {
        Ok(event) => {
            if !send_event(&mut sender, &event).await {
                state.dispatcher.unregister(conn_id).await;
                return;
            }
        }
        Err(e) => error!("{}: failed to load user list: {}", username, e),
    }
    match load_general_history(&state) {
        Ok(event) => {
            if !send_event(&mut sender, &event).await {
                state.dispatcher.unregister(conn_id).await;
                return;
            }
        }
        Err(e) => error!("{}: failed to load general history: {}", username, e),
    }

    // Subscribe before broadcasting presence so this socket sees its own join.
    let mut broadcast_rx = state.dispatcher.subscribe();
    state.dispatcher.broadcast(ServerEvent::OnlineUsers {
        users: state.dispatcher.online_users().await,
    });
    state.dispatcher.broadcast(ServerEvent::UserStatus {
        username: username.clone(),
        online: true,
    });

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events to the client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    if !send_event(&mut sender, &event).await {
                        break;
                    }
                }
                result = conn_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    if !send_event(&mut sender, &event).await {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client.
    let state_recv = state.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(cmd) => {
                            handle_command(&state_recv, &username_recv, &conn_tx, cmd).await;
                        }
                        Err(e) => {
                            warn!(
                                "{} bad command: {} -- raw: {}",
                                username_recv,
                                e,
                                truncate_for_log(&text, 200)
                            );
                        }
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    if let Some((username, was_last)) = state.dispatcher.unregister(conn_id).await {
        if let Err(e) = state.db.touch_last_online(&username, &Utc::now().to_rfc3339()) {
            warn!("{}: failed to update last_online: {}", username, e);
        }
        state.dispatcher.broadcast(ServerEvent::OnlineUsers {
            users: state.dispatcher.online_users().await,
        });
        if was_last {
            state.dispatcher.broadcast(ServerEvent::UserStatus {
                username: username.clone(),
                online: false,
            });
        }
        info!("{} disconnected", username);
    }
}

async fn handle_command(state: &SharedState, username: &str, tx: &Reply, cmd: ClientCommand) {
    match cmd {
        ClientCommand::Register { .. } | ClientCommand::Login { .. } => {
            warn!("{} sent auth command while logged in", username);
        }

        ClientCommand::LoadGeneralChat => match load_general_history(state) {
            Ok(event) => reply(tx, event),
            Err(e) => error!("{}: failed to load general history: {}", username, e),
        },

        ClientCommand::LoadPrivateMessages { username: other } => {
            match state.db.private_history(username, &other, HISTORY_LIMIT) {
                Ok(rows) => reply(
                    tx,
                    ServerEvent::PrivateHistory {
                        with: other,
                        messages: rows.into_iter().map(row_to_message).collect(),
                    },
                ),
                Err(e) => error!("{}: failed to load conversation with {}: {}", username, other, e),
            }
        }

        ClientCommand::SendMessage { message } => {
            let body = message.trim();
            if body.is_empty() {
                return;
            }
            let msg = text_message(username, GENERAL, body, true);
            persist_and_broadcast(state, msg).await;
        }

        ClientCommand::SendFile { filename, originalname, url, mimetype, caption } => {
            let msg = file_message(
                username, GENERAL, true, filename, originalname, url, mimetype, caption,
            );
            persist_and_broadcast(state, msg).await;
        }

        ClientCommand::SendPrivateMessage { to, message } => {
            let body = message.trim();
            if body.is_empty() {
                return;
            }
            let msg = text_message(username, &to, body, false);
            persist_and_deliver(state, tx, msg).await;
        }

        ClientCommand::SendPrivateFile { to, filename, originalname, url, mimetype, caption } => {
            let msg = file_message(
                username, &to, false, filename, originalname, url, mimetype, caption,
            );
            persist_and_deliver(state, tx, msg).await;
        }

        ClientCommand::DeleteMessage { id } => match state.db.get_message(id) {
            Ok(Some(row)) if row.from_user == username => match state.db.delete_message(id) {
                Ok(true) => state.dispatcher.broadcast(ServerEvent::MessageDeleted { id }),
                Ok(false) => {}
                Err(e) => error!("{}: failed to delete message {}: {}", username, id, e),
            },
            Ok(Some(row)) => {
                warn!(
                    "{} tried to delete message {} owned by {}",
                    username, id, row.from_user
                );
            }
            Ok(None) => {}
            Err(e) => error!("{}: failed to look up message {}: {}", username, id, e),
        },

        ClientCommand::MarkAsRead { from } => {
            match state.db.mark_conversation_read(&from, username) {
                Ok(ids) if !ids.is_empty() => {
                    state
                        .dispatcher
                        .send_to_user(
                            &from,
                            ServerEvent::MessagesRead { by: username.to_string(), ids },
                        )
                        .await;
                }
                Ok(_) => {}
                Err(e) => error!("{}: failed to mark messages read: {}", username, e),
            }
        }

        ClientCommand::GetProfile { username: who } => match state.db.get_user_by_username(&who) {
            Ok(Some(user)) => reply(tx, ServerEvent::Profile { profile: profile_from_row(&user) }),
            Ok(None) => warn!("{}: profile request for unknown user {}", username, who),
            Err(e) => error!("{}: failed to load profile of {}: {}", username, who, e),
        },

        ClientCommand::UpdateProfile { status_text } => {
            let result = state.db.update_status_text(username, &status_text);
            finish_profile_update(state, username, tx, result).await;
        }

        ClientCommand::UpdateAvatar { avatar_url } => {
            let result = state.db.update_avatar_url(username, &avatar_url);
            finish_profile_update(state, username, tx, result).await;
        }

        ClientCommand::SubscribeToPush { subscription } => {
            let serialized = match serde_json::to_string(&subscription) {
                Ok(s) => s,
                Err(e) => {
                    warn!("{}: unserializable push subscription: {}", username, e);
                    return;
                }
            };
            if let Err(e) = state.db.upsert_push_subscription(username, &serialized) {
                error!("{}: failed to store push subscription: {}", username, e);
            }
        }

        // Call signaling is an opaque relay; nothing is persisted. Only the
        // initial ring reports an offline callee back to the caller.
        ClientCommand::InitiateCall { to, call_type } => {
            let delivered = state
                .dispatcher
                .send_to_user(
                    &to,
                    ServerEvent::IncomingCall { from: username.to_string(), call_type },
                )
                .await;
            if !delivered {
                reply(tx, ServerEvent::CallUnavailable { username: to });
            }
        }
        ClientCommand::AcceptCall { to } => {
            relay(state, &to, ServerEvent::CallAccepted { from: username.to_string() }).await;
        }
        ClientCommand::RejectCall { to } => {
            relay(state, &to, ServerEvent::CallRejected { from: username.to_string() }).await;
        }
        ClientCommand::CallOffer { to, sdp } => {
            relay(state, &to, ServerEvent::CallOffer { from: username.to_string(), sdp }).await;
        }
        ClientCommand::CallAnswer { to, sdp } => {
            relay(state, &to, ServerEvent::CallAnswer { from: username.to_string(), sdp }).await;
        }
        ClientCommand::IceCandidate { to, candidate, sdp_mid, sdp_m_line_index } => {
            relay(
                state,
                &to,
                ServerEvent::IceCandidate {
                    from: username.to_string(),
                    candidate,
                    sdp_mid,
                    sdp_m_line_index,
                },
            )
            .await;
        }
        ClientCommand::EndCall { to } => {
            relay(state, &to, ServerEvent::CallEnded { from: username.to_string() }).await;
        }
    }
}

/// Persist a general message and fan it out to every connected socket,
/// sender included.
async fn persist_and_broadcast(state: &SharedState, mut msg: ChatMessage) {
    let created = msg.created_at.to_rfc3339();
    match state.db.insert_message(&to_new_message(&msg, &created)) {
        Ok(id) => {
            msg.id = id;
            state.dispatcher.broadcast(ServerEvent::NewMessage { message: msg });
        }
        Err(e) => error!("failed to store general message from {}: {}", msg.from, e),
    }
}

/// Persist a private message, echo it to the sender, deliver it to one of
/// the recipient's sockets if online, otherwise fall back to a push tickle.
///
/// There is no atomicity between persist and deliver: a crash in between
/// keeps the stored row and drops delivery.
async fn persist_and_deliver(state: &SharedState, tx: &Reply, mut msg: ChatMessage) {
    let created = msg.created_at.to_rfc3339();
    let id = match state.db.insert_message(&to_new_message(&msg, &created)) {
        Ok(id) => id,
        Err(e) => {
            error!("failed to store private message from {}: {}", msg.from, e);
            return;
        }
    };
    msg.id = id;

    let delivered = state
        .dispatcher
        .send_to_user(&msg.to, ServerEvent::PrivateMessage { message: msg.clone() })
        .await;

    if delivered {
        msg.read_status = READ_STATUS_DELIVERED;
        if let Err(e) = state.db.set_read_status(id, READ_STATUS_DELIVERED) {
            warn!("failed to mark message {} delivered: {}", id, e);
        }
    } else if let Ok(Some(subscription)) = state.db.get_push_subscription(&msg.to) {
        let push = state.push.clone();
        let recipient = msg.to.clone();
        tokio::spawn(async move {
            push.notify(&recipient, &subscription).await;
        });
    }

    reply(tx, ServerEvent::PrivateMessage { message: msg });
}

async fn finish_profile_update(
    state: &SharedState,
    username: &str,
    tx: &Reply,
    result: anyhow::Result<()>,
) {
    match result {
        Ok(()) => {
            reply(
                tx,
                ServerEvent::ProfileUpdated {
                    success: true,
                    message: "Profile updated".to_string(),
                },
            );
            // Re-broadcast the profile so peers refresh their caches.
            match state.db.get_user_by_username(username) {
                Ok(Some(user)) => {
                    state
                        .dispatcher
                        .broadcast(ServerEvent::Profile { profile: profile_from_row(&user) });
                }
                Ok(None) => {}
                Err(e) => warn!("{}: failed to reload profile: {}", username, e),
            }
        }
        Err(e) => {
            error!("{}: profile update failed: {}", username, e);
            reply(
                tx,
                ServerEvent::ProfileUpdated {
                    success: false,
                    message: "Server error".to_string(),
                },
            );
        }
    }
}

async fn relay(state: &SharedState, to: &str, event: ServerEvent) {
    state.dispatcher.send_to_user(to, event).await;
}

fn reply(tx: &Reply, event: ServerEvent) {
    let _ = tx.send(event);
}

async fn send_event(sender: &mut WsSender, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            error!("failed to serialize event: {}", e);
            true
        }
    }
}

fn load_users_list(state: &SharedState) -> anyhow::Result<ServerEvent> {
    let users = state.db.list_users()?;
    Ok(ServerEvent::UsersList {
        users: users.iter().map(profile_from_row).collect(),
    })
}

fn load_general_history(state: &SharedState) -> anyhow::Result<ServerEvent> {
    let rows = state.db.general_history(HISTORY_LIMIT)?;
    Ok(ServerEvent::GeneralHistory {
        messages: rows.into_iter().map(row_to_message).collect(),
    })
}

fn text_message(from: &str, to: &str, body: &str, is_general: bool) -> ChatMessage {
    ChatMessage {
        id: 0,
        from: from.to_string(),
        to: to.to_string(),
        message: Some(body.to_string()),
        filename: None,
        originalname: None,
        url: None,
        mimetype: None,
        caption: None,
        kind: MessageKind::Text,
        is_general,
        read_status: READ_STATUS_STORED,
        created_at: Utc::now(),
    }
}

#[allow(clippy::too_many_arguments)]
fn file_message(
    from: &str,
    to: &str,
    is_general: bool,
    filename: String,
    originalname: String,
    url: String,
    mimetype: String,
    caption: Option<String>,
) -> ChatMessage {
    ChatMessage {
        id: 0,
        from: from.to_string(),
        to: to.to_string(),
        message: None,
        filename: Some(filename),
        originalname: Some(originalname),
        url: Some(url),
        mimetype: Some(mimetype),
        caption,
        kind: MessageKind::File,
        is_general,
        read_status: READ_STATUS_STORED,
        created_at: Utc::now(),
    }
}

fn to_new_message<'a>(msg: &'a ChatMessage, created_at: &'a str) -> NewMessage<'a> {
    NewMessage {
        from_user: &msg.from,
        to_user: &msg.to,
        message: msg.message.as_deref(),
        filename: msg.filename.as_deref(),
        originalname: msg.originalname.as_deref(),
        url: msg.url.as_deref(),
        mimetype: msg.mimetype.as_deref(),
        caption: msg.caption.as_deref(),
        kind: msg.kind.as_str(),
        is_general: msg.is_general,
        created_at,
    }
}

fn row_to_message(row: MessageRow) -> ChatMessage {
    ChatMessage {
        id: row.id,
        from: row.from_user,
        to: row.to_user,
        message: row.message,
        filename: row.filename,
        originalname: row.originalname,
        url: row.url,
        mimetype: row.mimetype,
        caption: row.caption,
        kind: if row.kind == "file" { MessageKind::File } else { MessageKind::Text },
        is_general: row.is_general,
        read_status: row.read_status.clamp(0, 2) as u8,
        created_at: parse_timestamp(&row.created_at),
    }
}

fn profile_from_row(user: &UserRow) -> UserProfile {
    UserProfile {
        username: user.username.clone(),
        avatar_url: user.avatar_url.clone(),
        status_text: user.status_text.clone(),
        last_online: user.last_online.as_deref().map(parse_timestamp),
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') default has no timezone suffix.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

/// Bound a raw frame for logging, backing off to a char boundary so
/// multibyte text never splits mid-character.
fn truncate_for_log(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn command_name(cmd: &ClientCommand) -> &'static str {
    match cmd {
        ClientCommand::Register { .. } => "register",
        ClientCommand::Login { .. } => "login",
        ClientCommand::LoadGeneralChat => "load-general-chat",
        ClientCommand::LoadPrivateMessages { .. } => "load-private-messages",
        ClientCommand::SendMessage { .. } => "send-message",
        ClientCommand::SendFile { .. } => "send-file",
        ClientCommand::SendPrivateMessage { .. } => "send-private-message",
        ClientCommand::SendPrivateFile { .. } => "send-private-file",
        ClientCommand::DeleteMessage { .. } => "delete-message",
        ClientCommand::MarkAsRead { .. } => "mark-as-read",
        ClientCommand::GetProfile { .. } => "get-profile",
        ClientCommand::UpdateProfile { .. } => "update-profile",
        ClientCommand::UpdateAvatar { .. } => "update-avatar",
        ClientCommand::SubscribeToPush { .. } => "subscribe-to-push",
        ClientCommand::InitiateCall { .. } => "initiate-call",
        ClientCommand::AcceptCall { .. } => "accept-call",
        ClientCommand::RejectCall { .. } => "reject-call",
        ClientCommand::CallOffer { .. } => "call-offer",
        ClientCommand::CallAnswer { .. } => "call-answer",
        ClientCommand::IceCandidate { .. } => "ice-candidate",
        ClientCommand::EndCall { .. } => "end-call",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatewayState;
    use crate::dispatcher::Dispatcher;
    use crate::push::PushClient;
    use rodnya_db::Database;
    use rodnya_types::models::READ_STATUS_READ;

    fn test_state() -> SharedState {
        Arc::new(GatewayState {
            db: Arc::new(Database::open_in_memory().unwrap()),
            dispatcher: Dispatcher::new(),
            push: PushClient::new(),
        })
    }

    async fn connect(
        state: &SharedState,
        username: &str,
    ) -> (Reply, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        state.dispatcher.register(username, tx.clone()).await;
        (tx, rx)
    }

    #[tokio::test]
    async fn general_message_fans_out_and_persists() {
        let state = test_state();
        let (tx_a, _rx_a) = connect(&state, "alice").await;
        let mut watcher_a = state.dispatcher.subscribe();
        let mut watcher_b = state.dispatcher.subscribe();

        handle_command(
            &state,
            "alice",
            &tx_a,
            ClientCommand::SendMessage { message: "hello all".into() },
        )
        .await;

        for watcher in [&mut watcher_a, &mut watcher_b] {
            match watcher.recv().await.unwrap() {
                ServerEvent::NewMessage { message } => {
                    assert_eq!(message.from, "alice");
                    assert_eq!(message.to, GENERAL);
                    assert_eq!(message.message.as_deref(), Some("hello all"));
                    assert!(message.id > 0);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        assert_eq!(state.db.general_history(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_general_message_is_dropped() {
        let state = test_state();
        let (tx_a, _rx_a) = connect(&state, "alice").await;

        handle_command(
            &state,
            "alice",
            &tx_a,
            ClientCommand::SendMessage { message: "   ".into() },
        )
        .await;

        assert!(state.db.general_history(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn private_message_to_offline_user_is_persisted_not_delivered() {
        let state = test_state();
        let (tx_a, mut rx_a) = connect(&state, "alice").await;
        let (_tx_c, mut rx_c) = connect(&state, "carol").await;

        handle_command(
            &state,
            "alice",
            &tx_a,
            ClientCommand::SendPrivateMessage { to: "bob".into(), message: "psst".into() },
        )
        .await;

        // Sender gets the echo, the unrelated user gets nothing.
        match rx_a.recv().await.unwrap() {
            ServerEvent::PrivateMessage { message } => {
                assert_eq!(message.read_status, READ_STATUS_STORED);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx_c.try_recv().is_err());

        let convo = state.db.private_history("alice", "bob", 10).unwrap();
        assert_eq!(convo.len(), 1);
        assert_eq!(convo[0].read_status, READ_STATUS_STORED as i64);
    }

    #[tokio::test]
    async fn private_message_to_online_user_is_marked_delivered() {
        let state = test_state();
        let (tx_a, mut rx_a) = connect(&state, "alice").await;
        let (_tx_b, mut rx_b) = connect(&state, "bob").await;
        handle_command(
            &state,
            "alice",
            &tx_a,
            ClientCommand::SendPrivateMessage { to: "bob".into(), message: "hi".into() },
        )
        .await;

        let delivered = rx_b.recv().await.unwrap();
        assert!(matches!(delivered, ServerEvent::PrivateMessage { .. }));

        match rx_a.recv().await.unwrap() {
            ServerEvent::PrivateMessage { message } => {
                assert_eq!(message.read_status, READ_STATUS_DELIVERED);
                let row = state.db.get_message(message.id).unwrap().unwrap();
                assert_eq!(row.read_status, READ_STATUS_DELIVERED as i64);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn mark_as_read_notifies_the_sender() {
        let state = test_state();
        let (tx_a, mut rx_a) = connect(&state, "alice").await;
        let (tx_b, mut rx_b) = connect(&state, "bob").await;
        handle_command(
            &state,
            "alice",
            &tx_a,
            ClientCommand::SendPrivateMessage { to: "bob".into(), message: "read me".into() },
        )
        .await;
        let id = match rx_b.recv().await.unwrap() {
            ServerEvent::PrivateMessage { message } => message.id,
            other => panic!("unexpected event: {:?}", other),
        };
        rx_a.recv().await.unwrap(); // drain the echo

        handle_command(&state, "bob", &tx_b, ClientCommand::MarkAsRead { from: "alice".into() })
            .await;

        match rx_a.recv().await.unwrap() {
            ServerEvent::MessagesRead { by, ids } => {
                assert_eq!(by, "bob");
                assert_eq!(ids, vec![id]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        let row = state.db.get_message(id).unwrap().unwrap();
        assert_eq!(row.read_status, READ_STATUS_READ as i64);
    }

    #[tokio::test]
    async fn only_the_author_can_delete_a_message() {
        let state = test_state();
        let (tx_a, _rx_a) = connect(&state, "alice").await;
        let (tx_b, _rx_b) = connect(&state, "bob").await;
        let mut watcher = state.dispatcher.subscribe();

        handle_command(
            &state,
            "alice",
            &tx_a,
            ClientCommand::SendMessage { message: "to be deleted".into() },
        )
        .await;
        let id = match watcher.recv().await.unwrap() {
            ServerEvent::NewMessage { message } => message.id,
            other => panic!("unexpected event: {:?}", other),
        };

        handle_command(&state, "bob", &tx_b, ClientCommand::DeleteMessage { id }).await;
        assert!(state.db.get_message(id).unwrap().is_some());

        handle_command(&state, "alice", &tx_a, ClientCommand::DeleteMessage { id }).await;
        match watcher.recv().await.unwrap() {
            ServerEvent::MessageDeleted { id: deleted } => assert_eq!(deleted, id),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(state.db.get_message(id).unwrap().is_none());
    }

    #[tokio::test]
    async fn call_signals_relay_to_the_target_only() {
        let state = test_state();
        let (tx_a, mut rx_a) = connect(&state, "alice").await;
        let (_tx_b, mut rx_b) = connect(&state, "bob").await;
        handle_command(
            &state,
            "alice",
            &tx_a,
            ClientCommand::InitiateCall {
                to: "bob".into(),
                call_type: rodnya_types::events::CallType::Video,
            },
        )
        .await;
        match rx_b.recv().await.unwrap() {
            ServerEvent::IncomingCall { from, call_type } => {
                assert_eq!(from, "alice");
                assert_eq!(call_type, rodnya_types::events::CallType::Video);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Ringing an offline user bounces back to the caller.
        handle_command(
            &state,
            "alice",
            &tx_a,
            ClientCommand::InitiateCall {
                to: "nobody".into(),
                call_type: rodnya_types::events::CallType::Audio,
            },
        )
        .await;
        match rx_a.recv().await.unwrap() {
            ServerEvent::CallUnavailable { username } => assert_eq!(username, "nobody"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn log_truncation_respects_char_boundaries() {
        assert_eq!(truncate_for_log("short", 200), "short");

        // Byte 200 lands inside the two-byte 'я'; back off instead of panicking.
        let frame = "x".repeat(199) + "яя";
        let cut = truncate_for_log(&frame, 200);
        assert_eq!(cut.len(), 199);
        assert!(cut.chars().all(|c| c == 'x'));

        let cyrillic = "привет".repeat(50);
        let cut = truncate_for_log(&cyrillic, 200);
        assert!(cut.len() <= 200);
        assert!(cyrillic.starts_with(cut));
    }

    #[test]
    fn timestamps_parse_with_sqlite_fallback() {
        let rfc = parse_timestamp("2024-03-01T12:00:00+00:00");
        assert_eq!(rfc.to_rfc3339(), "2024-03-01T12:00:00+00:00");

        let naive = parse_timestamp("2024-03-01 12:00:00");
        assert_eq!(naive, rfc);

        assert_eq!(parse_timestamp("garbage"), DateTime::<Utc>::default());
    }

    #[test]
    fn file_rows_map_to_file_messages() {
        let row = MessageRow {
            id: 7,
            from_user: "alice".into(),
            to_user: "bob".into(),
            message: None,
            filename: Some("1-cat.png".into()),
            originalname: Some("cat.png".into()),
            url: Some("/uploads/1-cat.png".into()),
            mimetype: Some("image/png".into()),
            caption: Some("look".into()),
            kind: "file".into(),
            is_general: false,
            read_status: 1,
            created_at: "2024-03-01 12:00:00".into(),
        };

        let msg = row_to_message(row);
        assert_eq!(msg.kind, MessageKind::File);
        assert_eq!(msg.read_status, READ_STATUS_DELIVERED);
        assert_eq!(msg.url.as_deref(), Some("/uploads/1-cat.png"));
    }
}
