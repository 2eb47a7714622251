use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ChannelId, GroupId, InvitationId, ServerId, TargetId},
    protocol::{
        CreateChannelRequest, CreateChannelResponse, GetServerResponse, Invitation,
        JoinServerResponse, Message, NewInvitationRequest, ServerPreview,
    },
    validation::ValidationError,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

pub mod api;
pub mod config;
pub mod error;
pub mod message_cache;
pub mod push;
pub mod refresh;
pub mod session;

pub use api::ApiClient;
pub use config::{load_settings, ClientConfig};
pub use error::{ClientError, RefreshError};
pub use message_cache::{apply_incoming_push, merge, CacheUpdate, MessageCache, UpdateOrigin};
pub use push::{Backoff, PushHandle, PushStatus, PushStream};
pub use session::{FileTokenStore, MemoryTokenStore, SessionEvent, StoredSession, TokenStore};

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<(), ClientError>;
    async fn register(&self, username: &str, email: &str, password: &str)
        -> Result<(), ClientError>;
    async fn logout(&self) -> Result<(), ClientError>;
    async fn list_servers(&self) -> Result<Vec<ServerPreview>, ClientError>;
    async fn open_server(&self, server_id: &ServerId) -> Result<GetServerResponse, ClientError>;
    async fn create_server(&self, name: &str) -> Result<ServerPreview, ClientError>;
    async fn create_channel(
        &self,
        server_id: &ServerId,
        name: &str,
        description: &str,
    ) -> Result<CreateChannelResponse, ClientError>;
    async fn create_invitation(&self, server_id: &ServerId) -> Result<Invitation, ClientError>;
    async fn join_invitation(
        &self,
        invitation_id: &InvitationId,
    ) -> Result<JoinServerResponse, ClientError>;
    async fn load_channel(&self, channel_id: &ChannelId) -> Result<Vec<Message>, ClientError>;
    async fn load_group(&self, group_id: &GroupId) -> Result<Vec<Message>, ClientError>;
    async fn send_message(&self, target: &TargetId, content: &str)
        -> Result<Message, ClientError>;
    fn messages(&self, target: &TargetId) -> Vec<Message>;
    fn subscribe_cache(&self) -> broadcast::Receiver<CacheUpdate>;
    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent>;
}

pub struct ChatClient {
    config: ClientConfig,
    api: Arc<ApiClient>,
    cache: Arc<MessageCache>,
    push: Mutex<Option<PushHandle>>,
}

impl ChatClient {
    pub fn new(config: ClientConfig, tokens: Arc<dyn TokenStore>) -> Result<Arc<Self>, ClientError> {
        let api = ApiClient::new(&config, tokens)?;
        Ok(Arc::new(Self {
            config,
            api: Arc::new(api),
            cache: Arc::new(MessageCache::new()),
            push: Mutex::new(None),
        }))
    }

    /// Uses the configured session file, or keeps tokens in memory when none is set.
    pub fn from_config(config: ClientConfig) -> Result<Arc<Self>, ClientError> {
        let tokens: Arc<dyn TokenStore> = match &config.token_path {
            Some(path) => Arc::new(FileTokenStore::new(path.clone())),
            None => Arc::new(MemoryTokenStore::new()),
        };
        Self::new(config, tokens)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    /// Starts the push stream unless one is already running.
    pub async fn connect_push(&self) -> Result<broadcast::Receiver<PushStatus>, ClientError> {
        let mut guard = self.push.lock().await;
        if let Some(handle) = guard.as_ref().filter(|handle| !handle.is_finished()) {
            return Ok(handle.subscribe());
        }

        let ws_url = self
            .config
            .ws_endpoint()
            .map_err(|err| ClientError::Config(format!("{err:#}")))?;
        info!(url = %ws_url, "push: connecting");
        let handle = PushStream::spawn(
            ws_url,
            Arc::clone(&self.api),
            Arc::clone(&self.cache),
            self.config.push_backoff(),
        );
        let status = handle.subscribe();
        *guard = Some(handle);
        Ok(status)
    }

    pub async fn disconnect_push(&self) {
        if let Some(handle) = self.push.lock().await.take() {
            handle.shutdown();
            info!("push: disconnected");
        }
    }

    async fn load_target(&self, target: TargetId) -> Result<Vec<Message>, ClientError> {
        let limit = self.config.page_size();
        let page = match &target {
            TargetId::Channel(id) => self.api.fetch_channel_messages(id, limit).await?,
            TargetId::Group(id) => self.api.fetch_group_messages(id, limit).await?,
        };
        Ok(self.cache.apply_fetch(target, page.result))
    }
}

#[async_trait]
impl ClientHandle for ChatClient {
    async fn login(&self, username: &str, password: &str) -> Result<(), ClientError> {
        self.api.login(username, password).await
    }

    async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<(), ClientError> {
        self.api.register(username, email, password).await?;
        self.api.login(username, password).await
    }

    async fn logout(&self) -> Result<(), ClientError> {
        self.disconnect_push().await;
        let outcome = self.api.logout().await;
        self.cache.clear();
        outcome
    }

    async fn list_servers(&self) -> Result<Vec<ServerPreview>, ClientError> {
        self.api.fetch_servers().await
    }

    async fn open_server(&self, server_id: &ServerId) -> Result<GetServerResponse, ClientError> {
        self.api.fetch_server(server_id).await
    }

    async fn create_server(&self, name: &str) -> Result<ServerPreview, ClientError> {
        self.api.create_server(name).await
    }

    async fn create_channel(
        &self,
        server_id: &ServerId,
        name: &str,
        description: &str,
    ) -> Result<CreateChannelResponse, ClientError> {
        let request = CreateChannelRequest {
            name: name.trim().to_string(),
            description: description.trim().to_string(),
            parent_category: None,
            server_id: server_id.clone(),
        };
        self.api.create_channel(&request).await
    }

    async fn create_invitation(&self, server_id: &ServerId) -> Result<Invitation, ClientError> {
        self.api
            .create_invitation(server_id, &NewInvitationRequest::default())
            .await
    }

    async fn join_invitation(
        &self,
        invitation_id: &InvitationId,
    ) -> Result<JoinServerResponse, ClientError> {
        self.api.join_invitation(invitation_id).await
    }

    async fn load_channel(&self, channel_id: &ChannelId) -> Result<Vec<Message>, ClientError> {
        self.load_target(TargetId::Channel(channel_id.clone())).await
    }

    async fn load_group(&self, group_id: &GroupId) -> Result<Vec<Message>, ClientError> {
        self.load_target(TargetId::Group(group_id.clone())).await
    }

    /// The cache only changes once the backend has accepted the message.
    async fn send_message(
        &self,
        target: &TargetId,
        content: &str,
    ) -> Result<Message, ClientError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::validation(
                "message",
                ValidationError::Field {
                    field: "content",
                    reason: "must not be empty".into(),
                },
            ));
        }

        let created = match self.api.send_message(target, content).await {
            Ok(created) => created,
            Err(err) => {
                warn!(%target, error = %err, "chat: send failed");
                return Err(err);
            }
        };
        Ok(self.cache.apply_sent(target.clone(), &created, content))
    }

    fn messages(&self, target: &TargetId) -> Vec<Message> {
        self.cache.get(target)
    }

    fn subscribe_cache(&self) -> broadcast::Receiver<CacheUpdate> {
        self.cache.subscribe()
    }

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.api.subscribe_session()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
