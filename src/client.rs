//! Chat client facade
//!
//! Wires the REST collaborator, the Centrifugo connector and a realtime
//! session together for one logged-in user.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dtalks_realtime::client::ChatClient;
//! use dtalks_realtime::config::ClientConfig;
//! use dtalks_realtime::protocol::UserIdentity;
//! use std::path::Path;
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::load_from_file(Path::new("dtalks.toml"))?;
//! let user = UserIdentity { id: "u1".to_string(), username: "ada".to_string() };
//!
//! let client = ChatClient::connect(&config, user).await?;
//! client.open_chat("42").await?;
//! client.notify_typing("42").await;
//! # Ok::<(), dtalks_realtime::error::ChatError>(())
//! # });
//! ```

use crate::api::{ChatApi, ChatApiConfig, FileUpload, DEFAULT_HISTORY_LIMIT};
use crate::config::ClientConfig;
use crate::error::{ChatError, ChatResult};
use crate::protocol::{ChannelName, Message, OutgoingMessage, PresenceUpdate, TypingUpdate, UserIdentity};
use crate::realtime::{Session, SessionConfig, SessionHandle};
use crate::transport::centrifugo::CentrifugoConnector;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Destination of outbound typing flags
#[async_trait]
pub trait TypingPublisher: Send + Sync {
    async fn publish_typing(&self, update: TypingUpdate) -> ChatResult<()>;
}

#[async_trait]
impl TypingPublisher for ChatApi {
    async fn publish_typing(&self, update: TypingUpdate) -> ChatResult<()> {
        self.send_typing(&update).await
    }
}

/// Debounces the local user's typing flag per chat
///
/// The first keystroke of a burst publishes `is_typing = true`; after `idle`
/// without further keystrokes `is_typing = false` is published. Publish
/// failures are logged and otherwise ignored.
pub struct TypingNotifier {
    publisher: Arc<dyn TypingPublisher>,
    user: UserIdentity,
    idle: Duration,
    bursts: Arc<Mutex<HashMap<String, Burst>>>,
    next_generation: AtomicU64,
}

/// One open typing burst; `generation` identifies its idle timer
#[derive(Debug)]
struct Burst {
    generation: u64,
    idle_timer: AbortHandle,
}

impl TypingNotifier {
    pub fn new(publisher: Arc<dyn TypingPublisher>, user: UserIdentity, idle: Duration) -> Self {
        Self {
            publisher,
            user,
            idle,
            bursts: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Record a keystroke in `chat_id`
    pub async fn keystroke(&self, chat_id: &str) {
        let started = {
            let Ok(mut bursts) = self.bursts.lock() else {
                return;
            };
            let started = match bursts.remove(chat_id) {
                Some(burst) => {
                    burst.idle_timer.abort();
                    false
                }
                None => true,
            };
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let idle_timer = self.spawn_idle_timer(chat_id, generation);
            bursts.insert(
                chat_id.to_string(),
                Burst {
                    generation,
                    idle_timer,
                },
            );
            started
        };

        if started {
            publish(self.publisher.as_ref(), self.update(chat_id, true)).await;
        }
    }

    /// End the burst in `chat_id` now and publish `is_typing = false`
    pub async fn stop(&self, chat_id: &str) {
        self.cancel(chat_id);
        publish(self.publisher.as_ref(), self.update(chat_id, false)).await;
    }

    /// Whether a burst is open in `chat_id`
    pub fn is_typing(&self, chat_id: &str) -> bool {
        self.bursts
            .lock()
            .map(|bursts| bursts.contains_key(chat_id))
            .unwrap_or(false)
    }

    /// Drop every pending idle timer without publishing
    pub fn cancel_all(&self) {
        if let Ok(mut bursts) = self.bursts.lock() {
            for (_, burst) in bursts.drain() {
                burst.idle_timer.abort();
            }
        }
    }

    fn cancel(&self, chat_id: &str) {
        if let Ok(mut bursts) = self.bursts.lock() {
            if let Some(burst) = bursts.remove(chat_id) {
                burst.idle_timer.abort();
            }
        }
    }

    fn spawn_idle_timer(&self, chat_id: &str, generation: u64) -> AbortHandle {
        let publisher = Arc::clone(&self.publisher);
        let bursts = Arc::clone(&self.bursts);
        let update = self.update(chat_id, false);
        let idle = self.idle;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if end_burst(&bursts, &update.chat_id, generation) {
                publish(publisher.as_ref(), update).await;
            }
        })
        .abort_handle()
    }

    fn update(&self, chat_id: &str, is_typing: bool) -> TypingUpdate {
        TypingUpdate {
            chat_id: chat_id.to_string(),
            user_id: self.user.id.clone(),
            username: self.user.username.clone(),
            is_typing,
        }
    }
}

impl Drop for TypingNotifier {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Close the burst in `chat_id` if `generation` still owns it
///
/// A timer that lost the race with a newer keystroke leaves the newer burst
/// alone.
fn end_burst(bursts: &Mutex<HashMap<String, Burst>>, chat_id: &str, generation: u64) -> bool {
    let Ok(mut bursts) = bursts.lock() else {
        return false;
    };
    match bursts.get(chat_id) {
        Some(burst) if burst.generation == generation => {
            bursts.remove(chat_id);
            true
        }
        _ => false,
    }
}

async fn publish(publisher: &dyn TypingPublisher, update: TypingUpdate) {
    let (chat_id, is_typing) = (update.chat_id.clone(), update.is_typing);
    match publisher.publish_typing(update).await {
        Ok(()) => debug!(%chat_id, is_typing, "Typing flag sent"),
        Err(e) => warn!(%chat_id, is_typing, error = %e.sanitized_message(), "Failed to send typing flag"),
    }
}

/// One logged-in user's chat client
pub struct ChatClient {
    api: ChatApi,
    session: SessionHandle,
    user: UserIdentity,
    typing: TypingNotifier,
}

impl ChatClient {
    /// Connect the realtime session and announce the user as online
    pub async fn connect(config: &ClientConfig, user: UserIdentity) -> ChatResult<Self> {
        let api = ChatApi::new(ChatApiConfig::from_client_config(config)?)?;
        let connector = CentrifugoConnector::from_config(config);
        let session = Session::spawn(
            SessionConfig::from(config),
            Arc::new(api.clone()),
            Arc::new(connector),
        );

        let client = Self::from_parts(api, session, user, config.typing.idle());
        client.session.start()?;
        client.announce_presence(true).await;
        info!(
            user_id = %client.user.id,
            session_id = %client.session.session_id(),
            "Chat client connected"
        );
        Ok(client)
    }

    /// Assemble a client around an existing session
    pub fn from_parts(
        api: ChatApi,
        session: SessionHandle,
        user: UserIdentity,
        typing_idle: Duration,
    ) -> Self {
        let typing = TypingNotifier::new(Arc::new(api.clone()), user.clone(), typing_idle);
        Self {
            api,
            session,
            user,
            typing,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    /// Load the latest history page into the inbox, then subscribe to the
    /// chat's channel
    ///
    /// A failed history load is logged; the subscription still goes ahead.
    pub async fn open_chat(&self, chat_id: &str) -> ChatResult<ChannelName> {
        let channel =
            ChannelName::for_chat(chat_id).map_err(|e| ChatError::invalid_input(e.to_string()))?;

        match self.api.chat_messages(chat_id, 1, DEFAULT_HISTORY_LIMIT).await {
            Ok(history) => {
                let added = self.session.merge_history(history).await?;
                info!(chat_id, added, "Chat history loaded");
            }
            Err(e) => warn!(chat_id, error = %e.sanitized_message(), "Failed to load chat history"),
        }

        self.session.subscribe(channel.clone())?;
        Ok(channel)
    }

    /// Send a text message; the link must be connected
    pub async fn send_text(
        &self,
        chat_id: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> ChatResult<Message> {
        self.session.ensure_ready()?;
        self.typing.stop(chat_id).await;

        let mut message = OutgoingMessage::text(chat_id, content);
        if let Some(reply_to) = reply_to {
            message = message.replying_to(reply_to);
        }
        self.api.send_message(&message).await
    }

    /// Upload a file message; the link must be connected
    pub async fn send_file(&self, chat_id: &str, upload: FileUpload) -> ChatResult<Message> {
        self.session.ensure_ready()?;
        self.api.send_file_message(chat_id, upload).await
    }

    pub async fn notify_typing(&self, chat_id: &str) {
        self.typing.keystroke(chat_id).await;
    }

    pub async fn stop_typing(&self, chat_id: &str) {
        self.typing.stop(chat_id).await;
    }

    /// Announce the user as offline and tear the session down
    pub async fn logout(self) -> ChatResult<()> {
        self.typing.cancel_all();
        self.announce_presence(false).await;
        match self.session.teardown().await {
            Ok(()) | Err(ChatError::SessionClosed) => {
                info!(user_id = %self.user.id, "Logged out");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn announce_presence(&self, is_online: bool) {
        let update = PresenceUpdate {
            user_id: self.user.id.clone(),
            username: self.user.username.clone(),
            is_online,
            last_seen: Utc::now(),
        };
        if let Err(e) = self.api.update_online_status(&update).await {
            warn!(is_online, error = %e.sanitized_message(), "Failed to update online status");
        }
    }
}
