//! REST client for the chat backend.
//!
//! Every authenticated call goes through [`ApiClient::execute`], which owns
//! the expired-token handling: refresh once (shared with any concurrent
//! caller), replay once, and surface anything else unchanged.

use std::sync::Arc;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ChannelId, GroupId, InvitationId, ServerId, TargetId},
    error::{is_token_expired, ErrorBody, ErrorCode},
    protocol::{
        CreateChannelRequest, CreateChannelResponse, CreateMessageRequest, CreateMessageResponse,
        GetMessagesResponse, GetServerResponse, GetServersResponse, Invitation,
        JoinServerResponse, LoginRequest, NewInvitationRequest, NewServerRequest,
        NewServerResponse, RefreshRequest, RegisterRequest, ServerPreview, TokenPair,
    },
    validation::{decode, Validate},
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::{ClientConfig, MAX_MESSAGE_PAGE},
    error::{ClientError, RefreshError},
    refresh::{RefreshCoordinator, RefreshOutcome},
    session::{SessionEvent, TokenStore},
};

pub const SESSION_EXPIRED_NOTICE: &str = "Your session has expired. Please log in again.";
const SESSION_EVENT_CAPACITY: usize = 32;

pub struct ApiClient {
    http: Client,
    base_url: Url,
    tokens: Arc<dyn TokenStore>,
    refresh: RefreshCoordinator,
    session_events: broadcast::Sender<SessionEvent>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, tokens: Arc<dyn TokenStore>) -> Result<Self, ClientError> {
        let base_url = config
            .api_base()
            .map_err(|err| ClientError::Config(format!("{err:#}")))?;
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let (session_events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Ok(Self {
            http,
            base_url,
            tokens,
            refresh: RefreshCoordinator::new(),
            session_events,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_events.subscribe()
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    pub async fn access_token(&self) -> Result<Option<String>, ClientError> {
        Ok(self
            .tokens
            .load()
            .await
            .map_err(ClientError::token_store)?
            .map(|session| session.access_token))
    }

    pub async fn has_session(&self) -> Result<bool, ClientError> {
        Ok(self.access_token().await?.is_some())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), ClientError> {
        let body = LoginRequest {
            username: username.trim().to_string(),
            password: password.to_string(),
        };
        body.validate()
            .map_err(|err| ClientError::validation("login request", err))?;

        let url = self.endpoint("auth/login")?;
        let response = check_status(self.http.post(url).json(&body).send().await?).await?;
        let tokens: TokenPair = decode_response("login response", response).await?;

        self.tokens
            .save(&tokens)
            .await
            .map_err(ClientError::token_store)?;
        info!(username = %body.username, "auth: signed in");
        self.emit(SessionEvent::SignedIn);
        Ok(())
    }

    /// Creates the account. The backend answers with no tokens, so callers
    /// log in afterwards.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<(), ClientError> {
        let body = RegisterRequest {
            username: username.trim().to_string(),
            email: email.trim().to_string(),
            password: password.to_string(),
        };
        body.validate()
            .map_err(|err| ClientError::validation("register request", err))?;

        let url = self.endpoint("auth/register")?;
        check_status(self.http.post(url).json(&body).send().await?).await?;
        info!(username = %body.username, "auth: account registered");
        Ok(())
    }

    /// Ends the session on the backend. Local tokens are cleared whatever the
    /// backend answers.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let session = self
            .tokens
            .load()
            .await
            .map_err(ClientError::token_store)?
            .ok_or(ClientError::NoSession)?;

        let outcome = match self.endpoint("auth/logout") {
            Ok(url) => {
                let request = RefreshRequest {
                    refresh_token: session.refresh_token,
                };
                match self.http.post(url).json(&request).send().await {
                    Ok(response) => check_status(response).await.map(|_| ()),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err),
        };

        self.tokens.clear().await.map_err(ClientError::token_store)?;
        self.emit(SessionEvent::SignedOut);
        match &outcome {
            Ok(()) => info!("auth: signed out"),
            Err(err) => warn!(error = %err, "auth: backend logout failed; local session cleared"),
        }
        outcome
    }

    /// Rotate the token pair, joining a refresh that is already running.
    pub async fn refresh(&self) -> Result<TokenPair, ClientError> {
        let http = self.http.clone();
        let url = self.endpoint("auth/refresh")?;
        let tokens = Arc::clone(&self.tokens);
        let events = self.session_events.clone();
        Ok(self
            .refresh
            .run(move || perform_refresh(http, url, tokens, events))
            .await?)
    }

    /// Access token to use after `stale` was rejected.
    ///
    /// When the store already holds a different token another caller has
    /// refreshed in the meantime, and that token is returned as is.
    pub async fn refresh_after_rejection(&self, stale: Option<&str>) -> Result<String, ClientError> {
        let stored = self.access_token().await?;
        if let Some(current) = stored {
            if Some(current.as_str()) != stale {
                debug!("auth: token already rotated by another request");
                return Ok(current);
            }
        }
        Ok(self.refresh().await?.access_token)
    }

    pub async fn fetch_servers(&self) -> Result<Vec<ServerPreview>, ClientError> {
        let url = self.endpoint("server")?;
        let response: GetServersResponse = self
            .execute_json("server list", |http| http.get(url.clone()))
            .await?;
        Ok(response.result)
    }

    pub async fn fetch_server(&self, server_id: &ServerId) -> Result<GetServerResponse, ClientError> {
        let url = self.endpoint(&format!("server/{server_id}"))?;
        self.execute_json("server", |http| http.get(url.clone()))
            .await
    }

    /// Creates a server and returns its preview, built from a follow-up fetch.
    pub async fn create_server(&self, name: &str) -> Result<ServerPreview, ClientError> {
        let body = NewServerRequest {
            name: name.trim().to_string(),
        };
        body.validate()
            .map_err(|err| ClientError::validation("server name", err))?;

        let url = self.endpoint("server")?;
        let created: NewServerResponse = self
            .execute_json("create-server", |http| http.post(url.clone()).json(&body))
            .await?;
        info!(server_id = %created.id, "api: server created");

        let server = self.fetch_server(&created.id).await?;
        Ok(server.preview())
    }

    pub async fn create_channel(
        &self,
        request: &CreateChannelRequest,
    ) -> Result<CreateChannelResponse, ClientError> {
        let url = self.endpoint("channels")?;
        let created: CreateChannelResponse = self
            .execute_json("create-channel", |http| http.post(url.clone()).json(request))
            .await?;
        info!(
            server_id = %created.server_id,
            channel_id = %created.id,
            "api: channel created"
        );
        Ok(created)
    }

    pub async fn create_invitation(
        &self,
        server_id: &ServerId,
        request: &NewInvitationRequest,
    ) -> Result<Invitation, ClientError> {
        let url = self.endpoint(&format!("server/{server_id}/invitations"))?;
        self.execute_json("invitation", |http| http.post(url.clone()).json(request))
            .await
    }

    pub async fn join_invitation(
        &self,
        invitation_id: &InvitationId,
    ) -> Result<JoinServerResponse, ClientError> {
        let url = self.endpoint(&format!("invitations/{invitation_id}/join"))?;
        let joined: JoinServerResponse = self
            .execute_json("join", |http| http.post(url.clone()))
            .await?;
        info!(server_id = %joined.server.id, "api: joined server");
        Ok(joined)
    }

    pub async fn fetch_channel_messages(
        &self,
        channel_id: &ChannelId,
        limit: u32,
    ) -> Result<GetMessagesResponse, ClientError> {
        self.fetch_messages(&format!("message/channel/{channel_id}"), limit)
            .await
    }

    pub async fn fetch_group_messages(
        &self,
        group_id: &GroupId,
        limit: u32,
    ) -> Result<GetMessagesResponse, ClientError> {
        self.fetch_messages(&format!("message/group/{group_id}"), limit)
            .await
    }

    pub async fn send_message(
        &self,
        target: &TargetId,
        content: &str,
    ) -> Result<CreateMessageResponse, ClientError> {
        let body = CreateMessageRequest {
            content: content.to_string(),
            is_target_channel: target.is_channel(),
            target_id: target.as_str().to_string(),
        };
        let url = self.endpoint("message")?;
        self.execute_json("create-message", |http| http.post(url.clone()).json(&body))
            .await
    }

    pub async fn send_channel_message(
        &self,
        channel_id: &ChannelId,
        content: &str,
    ) -> Result<CreateMessageResponse, ClientError> {
        self.send_message(&TargetId::Channel(channel_id.clone()), content)
            .await
    }

    async fn fetch_messages(
        &self,
        path: &str,
        limit: u32,
    ) -> Result<GetMessagesResponse, ClientError> {
        let limit = limit.clamp(1, MAX_MESSAGE_PAGE);
        let url = self.endpoint(path)?;
        self.execute_json("messages", |http| {
            http.get(url.clone()).query(&[("limit", limit)])
        })
        .await
    }

    async fn execute_json<T, F>(&self, label: &'static str, build: F) -> Result<T, ClientError>
    where
        T: DeserializeOwned + Validate,
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self.execute(label, build).await?;
        decode_response(label, response).await
    }

    /// Send an authenticated request, refreshing and replaying it once when
    /// the backend reports the access token as expired.
    async fn execute<F>(&self, label: &'static str, build: F) -> Result<Response, ClientError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.access_token().await?;
        let response = self.dispatch(&build, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        let body = read_error_body(response).await;
        if !is_token_expired(StatusCode::UNAUTHORIZED.as_u16(), &body) {
            return Err(api_error(StatusCode::UNAUTHORIZED, body));
        }

        info!(request = label, "auth: access token expired; refreshing");
        let fresh = self.refresh_after_rejection(token.as_deref()).await?;

        let replay = self.dispatch(&build, Some(&fresh)).await?;
        if replay.status() != StatusCode::UNAUTHORIZED {
            return check_status(replay).await;
        }
        let body = read_error_body(replay).await;
        if is_token_expired(StatusCode::UNAUTHORIZED.as_u16(), &body) {
            warn!(request = label, "auth: replay rejected with a fresh token");
            return Err(ClientError::Unauthorized(body.error));
        }
        Err(api_error(StatusCode::UNAUTHORIZED, body))
    }

    async fn dispatch<F>(&self, build: &F, token: Option<&str>) -> Result<Response, ClientError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut request = build(&self.http);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|err| ClientError::Config(format!("invalid endpoint '{path}': {err}")))
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.session_events.send(event);
    }
}

async fn perform_refresh(
    http: Client,
    url: Url,
    tokens: Arc<dyn TokenStore>,
    events: broadcast::Sender<SessionEvent>,
) -> RefreshOutcome {
    let outcome = request_new_tokens(&http, url, tokens.as_ref()).await;
    match &outcome {
        Ok(_) => {
            info!("auth: tokens refreshed");
            let _ = events.send(SessionEvent::TokensRefreshed);
        }
        Err(err) => {
            warn!(error = %err, "auth: refresh failed; session ended");
            if let Err(clear_err) = tokens.clear().await {
                error!(error = %clear_err, "auth: failed to clear stored tokens");
            }
            let _ = events.send(SessionEvent::LoginRequired {
                notice: SESSION_EXPIRED_NOTICE.to_string(),
            });
        }
    }
    outcome
}

async fn request_new_tokens(http: &Client, url: Url, tokens: &dyn TokenStore) -> RefreshOutcome {
    let session = tokens
        .load()
        .await
        .map_err(|err| RefreshError::Store(format!("{err:#}")))?
        .ok_or(RefreshError::NoSession)?;

    let response = http
        .post(url)
        .json(&RefreshRequest {
            refresh_token: session.refresh_token,
        })
        .send()
        .await
        .map_err(|err| RefreshError::Transport(err.to_string()))?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| RefreshError::Transport(err.to_string()))?;
    if !status.is_success() {
        return Err(RefreshError::Rejected {
            status: status.as_u16(),
            message: ErrorBody::from_bytes(&bytes).error,
        });
    }

    let pair: TokenPair = decode(&bytes).map_err(|err| {
        error!(error = %err, "auth: refresh response failed validation");
        RefreshError::Validation(err)
    })?;
    tokens
        .save(&pair)
        .await
        .map_err(|err| RefreshError::Store(format!("{err:#}")))?;
    Ok(pair)
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = read_error_body(response).await;
    Err(api_error(status, body))
}

async fn read_error_body(response: Response) -> ErrorBody {
    let bytes = response.bytes().await.unwrap_or_default();
    ErrorBody::from_bytes(&bytes)
}

fn api_error(status: StatusCode, body: ErrorBody) -> ClientError {
    ClientError::Api {
        status: status.as_u16(),
        code: ErrorCode::from_status(status.as_u16()),
        message: body.error,
    }
}

async fn decode_response<T>(label: &'static str, response: Response) -> Result<T, ClientError>
where
    T: DeserializeOwned + Validate,
{
    let bytes = response.bytes().await?;
    decode(&bytes).map_err(|err| {
        error!(request = label, error = %err, "api: response failed validation");
        ClientError::validation(label, err)
    })
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
