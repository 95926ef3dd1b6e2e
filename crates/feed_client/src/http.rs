use api_types::{
    ErrorResponse,
    feed::FeedListResponse,
    session::{SessionRefresh, SessionTokens},
    transaction::{TransactionDeleted, TransactionView},
};
use async_trait::async_trait;
use feed_engine::{
    FeedQuery, NewTransaction, RemoteError, RemoteFeed, RemotePage, Transaction,
    TransactionPatch,
};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;

use crate::{ClientError, convert};

/// How requests are authenticated.
#[derive(Clone)]
pub enum Credentials {
    Basic { username: String, password: String },
    /// Bearer session; the access token is refreshed once when the server
    /// answers 401.
    Session {
        access_token: String,
        refresh_token: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Session { .. } => f.debug_struct("Session").finish_non_exhaustive(),
        }
    }
}

/// [`RemoteFeed`] over the JSON transactions API.
#[derive(Debug)]
pub struct HttpFeed {
    base_url: Url,
    http: reqwest::Client,
    credentials: RwLock<Credentials>,
}

impl HttpFeed {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self, ClientError> {
        Self::with_client(base_url, credentials, reqwest::Client::new())
    }

    pub fn with_client(
        base_url: &str,
        credentials: Credentials,
        http: reqwest::Client,
    ) -> Result<Self, ClientError> {
        let base_url =
            Url::parse(base_url).map_err(|err| ClientError::InvalidBaseUrl(err.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self {
            base_url,
            http,
            credentials: RwLock::new(credentials),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|err| RemoteError::Server(format!("invalid base_url: {err}")))
    }

    async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &*self.credentials.read().await {
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            Credentials::Session { access_token, .. } => request.bearer_auth(access_token),
        }
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, RemoteError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let endpoint = self.endpoint(path)?;
        let mut refreshed = false;
        loop {
            let mut request = self
                .authorize(self.http.request(method.clone(), endpoint.clone()))
                .await;
            if let Some(body) = body {
                request = request.json(body);
            }
            let res = request.send().await.map_err(transport)?;

            if res.status().is_success() {
                return res.json::<T>().await.map_err(transport);
            }

            let status = res.status();
            if status == StatusCode::UNAUTHORIZED && !refreshed && self.has_session().await {
                refreshed = true;
                if self.try_refresh().await {
                    continue;
                }
                return Err(RemoteError::Unauthorized);
            }

            let body = res
                .json::<ErrorResponse>()
                .await
                .map(|err| err.error)
                .unwrap_or_else(|_| "unknown error".to_string());
            tracing::debug!("{method} {path} failed with {status}: {body}");
            return Err(status_error(status, body));
        }
    }

    async fn has_session(&self) -> bool {
        matches!(&*self.credentials.read().await, Credentials::Session { .. })
    }

    /// Exchanges the refresh token for a new session.
    pub async fn refresh_session(&self) -> Result<(), RemoteError> {
        let refresh_token = match &*self.credentials.read().await {
            Credentials::Session { refresh_token, .. } => refresh_token.clone(),
            Credentials::Basic { .. } => return Err(RemoteError::Unauthorized),
        };

        let res = self
            .http
            .post(self.endpoint("session/refresh")?)
            .json(&SessionRefresh { refresh_token })
            .send()
            .await
            .map_err(transport)?;
        if !res.status().is_success() {
            return Err(RemoteError::Unauthorized);
        }
        let tokens = res.json::<SessionTokens>().await.map_err(transport)?;

        *self.credentials.write().await = Credentials::Session {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
        };
        Ok(())
    }

    /// Returns true if the refresh succeeded.
    async fn try_refresh(&self) -> bool {
        match self.refresh_session().await {
            Ok(()) => {
                tracing::debug!("refreshed expired session");
                true
            }
            Err(err) => {
                tracing::warn!("failed to refresh session: {err}");
                false
            }
        }
    }
}

fn transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::Transport("request timed out".to_string());
    }
    RemoteError::Transport(err.to_string())
}

fn status_error(status: StatusCode, body: String) -> RemoteError {
    match status.as_u16() {
        401 => RemoteError::Unauthorized,
        403 => RemoteError::Forbidden,
        404 => RemoteError::NotFound(body),
        409 => RemoteError::Conflict(body),
        422 => RemoteError::Validation(body),
        _ => RemoteError::Server(body),
    }
}

fn transaction_path(id: &str) -> String {
    format!("transactions/{id}")
}

#[async_trait]
impl RemoteFeed for HttpFeed {
    async fn list(&self, query: FeedQuery) -> Result<RemotePage, RemoteError> {
        let payload = convert::list_request(query);
        let res: FeedListResponse = self
            .send(Method::POST, "transactions/feed", Some(&payload))
            .await?;
        convert::page_from_response(res)
    }

    async fn create(
        &self,
        entity: NewTransaction,
        idempotency_key: String,
    ) -> Result<Transaction, RemoteError> {
        let payload = convert::create_request(entity, idempotency_key);
        let view: TransactionView = self
            .send(Method::POST, "transactions", Some(&payload))
            .await?;
        convert::transaction_from_view(view)
    }

    async fn update(&self, id: &str, patch: TransactionPatch) -> Result<Transaction, RemoteError> {
        let payload = convert::update_request(patch);
        let view: TransactionView = self
            .send(Method::PATCH, &transaction_path(id), Some(&payload))
            .await?;
        convert::transaction_from_view(view)
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        let ack: TransactionDeleted = self
            .send::<(), _>(Method::DELETE, &transaction_path(id), None)
            .await?;
        if !ack.deleted {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Transaction, RemoteError> {
        let view: TransactionView = self
            .send::<(), _>(Method::GET, &transaction_path(id), None)
            .await?;
        convert::transaction_from_view(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_must_parse() {
        let creds = Credentials::Basic {
            username: "u".to_string(),
            password: "p".to_string(),
        };
        assert!(matches!(
            HttpFeed::new("not a url", creds.clone()),
            Err(ClientError::InvalidBaseUrl(_))
        ));
        assert!(HttpFeed::new("http://127.0.0.1:3000/", creds).is_ok());
    }

    #[test]
    fn status_codes_map_to_remote_errors() {
        let body = || "nope".to_string();
        assert_eq!(status_error(StatusCode::FORBIDDEN, body()), RemoteError::Forbidden);
        assert_eq!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, body()),
            RemoteError::Validation("nope".to_string())
        );
        assert_eq!(
            status_error(StatusCode::BAD_GATEWAY, body()),
            RemoteError::Server("nope".to_string())
        );
    }

    #[test]
    fn debug_output_hides_secrets() {
        let creds = Credentials::Session {
            access_token: "secret-access".to_string(),
            refresh_token: "secret-refresh".to_string(),
        };
        assert!(!format!("{creds:?}").contains("secret"));
    }
}
