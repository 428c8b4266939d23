//! Mock Instagram client for testing
//!
//! A configurable stand-in for the real client that can simulate challenges,
//! bad passwords, expired sessions, paging and per-follower failures. Counters
//! and recorded calls are shared through `Arc`s so tests can inspect them after
//! the client has been handed to the code under test.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::{
    AuthClient, ClientFactory, ClientOptions, CloseFriendAction, FollowerPage, FollowerSource,
    InstagramClient, LoginOutcome, LoginRequest, ProbeOutcome, SessionState,
};

/// Configuration for mock client behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Password the service accepts; `None` accepts anything
    pub password: Option<String>,

    /// Verification code demanded by a login challenge
    pub verification_code: Option<String>,

    /// Two-factor code demanded at login
    pub two_factor_code: Option<String>,

    /// Return `LoginOutcome::UnknownError` with this message
    pub unknown_error: Option<String>,

    /// Whether a restored session passes the probe
    pub session_valid: Arc<Mutex<bool>>,

    /// Probe fails at the transport level
    pub probe_error: Option<String>,

    /// Numeric id of the logged-in user
    pub user_id: String,

    /// Followers available upstream, in page order
    pub followers: Vec<String>,

    /// Items per page
    pub page_size: usize,

    /// Always return a next cursor, generating ids forever
    pub endless: bool,

    /// Fail the page request with this index (0-based)
    pub fail_page: Option<usize>,

    /// Follower id whose close-friends add fails
    pub fail_on: Option<String>,

    /// Latency added to every call
    pub delay: Duration,

    pub login_calls: Arc<Mutex<usize>>,
    pub probe_calls: Arc<Mutex<usize>>,
    pub page_calls: Arc<Mutex<usize>>,

    /// Followers added to close friends, in order
    pub applied: Arc<Mutex<Vec<String>>>,

    /// Device uuids seen at each login
    pub login_devices: Arc<Mutex<Vec<Option<String>>>>,

    /// Proxy passed to each client built by the factory
    pub proxies: Arc<Mutex<Vec<Option<String>>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            password: None,
            verification_code: None,
            two_factor_code: None,
            unknown_error: None,
            session_valid: Arc::new(Mutex::new(true)),
            probe_error: None,
            user_id: "1000".to_string(),
            followers: Vec::new(),
            page_size: 50,
            endless: false,
            fail_page: None,
            fail_on: None,
            delay: Duration::from_millis(0),
            login_calls: Arc::new(Mutex::new(0)),
            probe_calls: Arc::new(Mutex::new(0)),
            page_calls: Arc::new(Mutex::new(0)),
            applied: Arc::new(Mutex::new(Vec::new())),
            login_devices: Arc::new(Mutex::new(Vec::new())),
            proxies: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl MockConfig {
    /// Upstream with `count` followers named "1".."count"
    pub fn with_followers(count: usize) -> Self {
        Self {
            followers: (1..=count).map(|i| i.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn login_calls(&self) -> usize {
        *self.login_calls.lock().unwrap()
    }

    pub fn probe_calls(&self) -> usize {
        *self.probe_calls.lock().unwrap()
    }

    pub fn page_calls(&self) -> usize {
        *self.page_calls.lock().unwrap()
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn login_devices(&self) -> Vec<Option<String>> {
        self.login_devices.lock().unwrap().clone()
    }

    pub fn proxies(&self) -> Vec<Option<String>> {
        self.proxies.lock().unwrap().clone()
    }

    pub fn set_session_valid(&self, valid: bool) {
        *self.session_valid.lock().unwrap() = valid;
    }
}

/// Mock client for one account
pub struct MockInstagram {
    config: MockConfig,
    state: SessionState,
    authenticated: bool,
}

impl MockInstagram {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            state: SessionState::default(),
            authenticated: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn latency(&self) {
        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }
    }
}

#[async_trait]
impl AuthClient for MockInstagram {
    async fn login(&mut self, request: LoginRequest<'_>) -> LoginOutcome {
        *self.config.login_calls.lock().unwrap() += 1;
        self.config
            .login_devices
            .lock()
            .unwrap()
            .push(self.state.uuids.get("uuid").cloned());
        self.latency().await;

        if let Some(message) = &self.config.unknown_error {
            return LoginOutcome::UnknownError(message.clone());
        }

        if let Some(expected) = &self.config.password {
            if request.password != expected {
                return LoginOutcome::BadCredentials;
            }
        }

        if let Some(expected) = &self.config.two_factor_code {
            match request.two_factor_code {
                None => return LoginOutcome::TwoFactorRequired,
                Some(code) if code != expected => {
                    return LoginOutcome::UnknownError("invalid two-factor code".to_string())
                }
                Some(_) => {}
            }
        }

        if let Some(expected) = &self.config.verification_code {
            if request.verification_code != Some(expected.as_str()) {
                return LoginOutcome::ChallengeRequired;
            }
        }

        if self.state.uuids.is_empty() {
            self.state.uuids = SessionState::new_device().uuids;
        }
        self.state.user_id = Some(self.config.user_id.clone());
        self.state.settings = serde_json::json!({
            "username": request.username,
            "sessionid": uuid::Uuid::new_v4().to_string(),
        });
        self.authenticated = true;
        LoginOutcome::Success
    }

    async fn probe(&mut self) -> Result<ProbeOutcome> {
        *self.config.probe_calls.lock().unwrap() += 1;
        self.latency().await;

        if let Some(message) = &self.config.probe_error {
            return Err(PlatformError::Network(message.clone()).into());
        }

        let valid = *self.config.session_valid.lock().unwrap() && self.state.user_id.is_some();
        if valid {
            self.authenticated = true;
            Ok(ProbeOutcome::Valid)
        } else {
            self.authenticated = false;
            Ok(ProbeOutcome::AuthRequired)
        }
    }

    fn dump_state(&self) -> SessionState {
        self.state.clone()
    }

    fn load_state(&mut self, state: SessionState) {
        self.state = state;
        self.authenticated = false;
    }
}

#[async_trait]
impl FollowerSource for MockInstagram {
    async fn page(&self, cursor: Option<&str>) -> Result<FollowerPage> {
        let index = {
            let mut calls = self.config.page_calls.lock().unwrap();
            *calls += 1;
            *calls - 1
        };
        self.latency().await;

        if !self.authenticated {
            return Err(PlatformError::Rejected("login_required".to_string()).into());
        }
        if self.config.fail_page == Some(index) {
            return Err(PlatformError::Network("connection reset".to_string()).into());
        }

        let offset: usize = match cursor {
            None => 0,
            Some(c) => c
                .parse()
                .map_err(|_| PlatformError::Rejected(format!("bad cursor '{}'", c)))?,
        };
        let size = self.config.page_size;

        if self.config.endless {
            return Ok(FollowerPage {
                items: (offset..offset + size).map(|i| format!("f{}", i)).collect(),
                next_cursor: Some((offset + size).to_string()),
            });
        }

        let end = (offset + size).min(self.config.followers.len());
        let items = self
            .config
            .followers
            .get(offset..end)
            .map(|s| s.to_vec())
            .unwrap_or_default();
        let next_cursor = (end < self.config.followers.len()).then(|| end.to_string());
        Ok(FollowerPage { items, next_cursor })
    }
}

#[async_trait]
impl CloseFriendAction for MockInstagram {
    async fn apply(&self, subject_id: &str) -> Result<()> {
        self.latency().await;

        if !self.authenticated {
            return Err(PlatformError::Rejected("login_required".to_string()).into());
        }
        if self.config.fail_on.as_deref() == Some(subject_id) {
            return Err(PlatformError::RateLimit(format!(
                "feedback_required while adding {}",
                subject_id
            ))
            .into());
        }

        self.config
            .applied
            .lock()
            .unwrap()
            .push(subject_id.to_string());
        Ok(())
    }
}

/// Factory handing out [`MockInstagram`] clients that share one config
#[derive(Debug, Clone, Default)]
pub struct MockClientFactory {
    pub config: MockConfig,
}

impl MockClientFactory {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for MockClientFactory {
    fn client(&self, _username: &str, options: &ClientOptions) -> Box<dyn InstagramClient> {
        self.config.proxies.lock().unwrap().push(options.proxy.clone());
        Box::new(MockInstagram::new(self.config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_login_success() {
        let mut client = MockInstagram::new(MockConfig::default());

        let outcome = client.login(LoginRequest::new("alice", "pw")).await;
        assert_eq!(outcome, LoginOutcome::Success);
        assert!(client.is_authenticated());
        assert_eq!(client.dump_state().user_id.as_deref(), Some("1000"));
    }

    #[tokio::test]
    async fn test_mock_bad_password() {
        let mut client = MockInstagram::new(MockConfig {
            password: Some("right".to_string()),
            ..Default::default()
        });

        let outcome = client.login(LoginRequest::new("alice", "wrong")).await;
        assert_eq!(outcome, LoginOutcome::BadCredentials);
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_mock_challenge_then_code() {
        let config = MockConfig {
            verification_code: Some("123456".to_string()),
            ..Default::default()
        };
        let mut client = MockInstagram::new(config.clone());

        let outcome = client.login(LoginRequest::new("alice", "pw")).await;
        assert_eq!(outcome, LoginOutcome::ChallengeRequired);

        let mut request = LoginRequest::new("alice", "pw");
        request.verification_code = Some("123456");
        assert_eq!(client.login(request).await, LoginOutcome::Success);
        assert_eq!(config.login_calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_paging() {
        let mut client = MockInstagram::new(MockConfig {
            page_size: 2,
            ..MockConfig::with_followers(3)
        });
        client.login(LoginRequest::new("alice", "pw")).await;

        let first = client.page(None).await.unwrap();
        assert_eq!(first.items, vec!["1", "2"]);
        assert_eq!(first.next_cursor.as_deref(), Some("2"));

        let second = client.page(first.next_cursor.as_deref()).await.unwrap();
        assert_eq!(second.items, vec!["3"]);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_mock_requires_authentication() {
        let client = MockInstagram::new(MockConfig::with_followers(3));

        assert!(client.page(None).await.is_err());
        let err = client.apply("1").await.unwrap_err();
        assert!(err.to_string().contains("login_required"));
    }

    #[tokio::test]
    async fn test_mock_apply_failure() {
        let config = MockConfig {
            fail_on: Some("2".to_string()),
            ..Default::default()
        };
        let mut client = MockInstagram::new(config.clone());
        client.login(LoginRequest::new("alice", "pw")).await;

        client.apply("1").await.unwrap();
        assert!(client.apply("2").await.is_err());
        assert_eq!(config.applied(), vec!["1"]);
    }

    #[tokio::test]
    async fn test_mock_probe_uses_restored_state() {
        let config = MockConfig::default();
        let mut client = MockInstagram::new(config.clone());
        assert_eq!(client.probe().await.unwrap(), ProbeOutcome::AuthRequired);

        let mut state = SessionState::new_device();
        state.user_id = Some("1000".to_string());
        client.load_state(state);
        assert_eq!(client.probe().await.unwrap(), ProbeOutcome::Valid);

        config.set_session_valid(false);
        assert_eq!(client.probe().await.unwrap(), ProbeOutcome::AuthRequired);
    }
}
