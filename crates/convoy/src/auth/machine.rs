use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::{AuthConfig, AuthError, AuthPhase, AuthResult};
use crate::agent::AutomationAgent;
use crate::driver::{AuthMethod, Challenge, ChallengeKind, DriverResult};
use crate::registry::{RegistryError, SessionMetadata, SessionRegistry, SessionStatus};
use crate::retry::{RetryPolicy, WaitOutcome, wait_until};

/// How [`AuthStateMachine::start`] left the session.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthStart {
    /// Persisted credentials were accepted; no challenge was issued and the
    /// session is `authenticated`.
    AlreadyAuthenticated,
    /// The session is `awaiting_auth`. `None` when no challenge could be
    /// captured in time; the caller may fetch again.
    AwaitingAuth(Option<Challenge>),
}

/// Drives one session's agent through authentication.
///
/// Cheap to build; the orchestrator creates one per lifecycle step.
pub struct AuthStateMachine {
    session_id: String,
    method: AuthMethod,
    phone: Option<String>,
    agent: Arc<AutomationAgent>,
    registry: Arc<SessionRegistry>,
    config: AuthConfig,
}

impl AuthStateMachine {
    pub fn new(
        session: &SessionMetadata,
        agent: Arc<AutomationAgent>,
        registry: Arc<SessionRegistry>,
        config: AuthConfig,
    ) -> Self {
        Self {
            session_id: session.session_id.clone(),
            method: session.auth_method,
            phone: session.requested_phone.clone(),
            agent,
            registry,
            config,
        }
    }

    /// The challenge this session asks for. A pairing code needs both the
    /// explicit intent and a phone number; anything else gets a QR code.
    pub fn challenge_method(&self) -> AuthMethod {
        match (self.method, &self.phone) {
            (AuthMethod::PairingCode, Some(_)) => AuthMethod::PairingCode,
            _ => AuthMethod::Qr,
        }
    }

    /// Start the driver and either restore authentication or issue a
    /// challenge.
    pub async fn start(&self) -> AuthResult<AuthStart> {
        self.registry
            .set_status(&self.session_id, SessionStatus::Initializing)?;
        self.agent.initialize().await?;

        let authenticated = match self.agent.check_authenticated().await {
            Ok(authenticated) => authenticated,
            Err(err) if !err.is_fatal() => {
                warn!(
                    "Session {}: authentication check failed, issuing a challenge: {}",
                    self.session_id, err
                );
                false
            }
            Err(err) => return Err(err.into()),
        };
        if authenticated {
            info!(
                "Session {}: persisted credentials accepted, skipping challenge",
                self.session_id
            );
            self.registry
                .set_status(&self.session_id, SessionStatus::Authenticated)?;
            return Ok(AuthStart::AlreadyAuthenticated);
        }

        self.registry
            .set_status(&self.session_id, SessionStatus::AwaitingAuth)?;
        let challenge = self.capture_challenge().await?;
        self.registry
            .set_auth_data(&self.session_id, challenge.clone())?;
        Ok(AuthStart::AwaitingAuth(challenge))
    }

    /// Wait for authentication (unless already confirmed), then for the
    /// client to be ready, then capture the account's phone number. Either
    /// budget running out is an [`AuthError::Timeout`].
    pub async fn confirm(&self) -> AuthResult<Option<String>> {
        let status = self
            .registry
            .get(&self.session_id)
            .map(|session| session.status)
            .ok_or_else(|| RegistryError::NotFound(self.session_id.clone()))?;

        if status != SessionStatus::Authenticated {
            self.wait_phase(AuthPhase::Authentication, self.config.auth_budget)
                .await?;
            self.registry
                .set_status(&self.session_id, SessionStatus::Authenticated)?;
        }

        self.wait_phase(AuthPhase::Ready, self.config.ready_budget)
            .await?;
        self.registry
            .set_status(&self.session_id, SessionStatus::Ready)?;
        self.registry.touch(&self.session_id);
        self.agent.set_authenticated(true);

        let phone = self.capture_phone_number().await;
        self.agent.start_monitor();
        Ok(phone)
    }

    /// Restart the challenge cycle after a remote logout. The session must be
    /// in `requires_reauth`; it ends in `awaiting_auth`.
    pub async fn restart(&self) -> AuthResult<Option<Challenge>> {
        self.agent.set_authenticated(false);
        self.agent.clear_challenge();

        let challenge = self.capture_challenge().await?;
        self.registry
            .set_auth_data(&self.session_id, challenge.clone())?;
        self.registry
            .set_status(&self.session_id, SessionStatus::AwaitingAuth)?;
        Ok(challenge)
    }

    /// Ask the driver for a current challenge and store it. Falls back to the
    /// latest pushed challenge when the driver has none to give.
    pub async fn fetch_challenge(&self) -> AuthResult<Option<Challenge>> {
        let method = self.challenge_method();
        let window = match method {
            AuthMethod::Qr => self.config.scrape_fallback_window,
            AuthMethod::PairingCode => self.config.pairing_window,
        };
        let challenge = match self.poll_challenge(method, window).await? {
            Some(challenge) => Some(challenge),
            None => self.latest_matching(method),
        };
        if challenge.is_some() {
            self.registry
                .set_auth_data(&self.session_id, challenge.clone())?;
        }
        Ok(challenge)
    }

    /// Obtain a challenge for the session's method. `Ok(None)` is a miss,
    /// not an error.
    async fn capture_challenge(&self) -> AuthResult<Option<Challenge>> {
        let challenge = match self.challenge_method() {
            AuthMethod::PairingCode => {
                self.poll_challenge(AuthMethod::PairingCode, self.config.pairing_window)
                    .await?
            }
            AuthMethod::Qr => self.capture_qr().await?,
        };

        match &challenge {
            Some(challenge) => info!(
                "Session {}: {:?} challenge captured",
                self.session_id, challenge.kind
            ),
            None => warn!(
                "Session {}: no challenge captured, waiting for an explicit fetch",
                self.session_id
            ),
        }
        Ok(challenge)
    }

    /// QR codes normally arrive as driver events; if none shows up within the
    /// event window, ask the driver directly for a while.
    async fn capture_qr(&self) -> AuthResult<Option<Challenge>> {
        let mut challenges = self.agent.watch_challenge();
        let pushed = match tokio::time::timeout(
            self.config.qr_event_window,
            challenges.wait_for(|latest| {
                latest
                    .as_ref()
                    .is_some_and(|challenge| challenge.kind == ChallengeKind::Qr)
            }),
        )
        .await
        {
            Ok(Ok(latest)) => (*latest).clone(),
            _ => None,
        };
        if pushed.is_some() {
            return Ok(pushed);
        }

        debug!(
            "Session {}: no QR event within {:?}, asking the driver",
            self.session_id, self.config.qr_event_window
        );
        match self
            .poll_challenge(AuthMethod::Qr, self.config.scrape_fallback_window)
            .await?
        {
            Some(challenge) => Ok(Some(challenge)),
            None => Ok(self.latest_matching(AuthMethod::Qr)),
        }
    }

    fn latest_matching(&self, method: AuthMethod) -> Option<Challenge> {
        self.agent
            .latest_challenge()
            .filter(|challenge| challenge.kind.satisfies(method))
    }

    /// Call `issue_challenge` until it produces a challenge of the right
    /// kind or `window` runs out. Only fatal driver errors abort.
    async fn poll_challenge(
        &self,
        method: AuthMethod,
        window: Duration,
    ) -> AuthResult<Option<Challenge>> {
        let policy = RetryPolicy::new(self.config.poll_interval, window);
        let agent = &self.agent;
        let phone = self.phone.as_deref();
        let session_id = self.session_id.as_str();

        let outcome = wait_until(&policy, move |attempt| async move {
            match agent.issue_challenge(method, phone).await {
                Ok(challenge) => challenge
                    .filter(|challenge| challenge.kind.satisfies(method))
                    .map(Ok),
                Err(err) if err.is_fatal() => Some(Err(err)),
                Err(err) => {
                    debug!(
                        "Session {}: challenge request {} failed: {}",
                        session_id, attempt, err
                    );
                    None
                }
            }
        })
        .await;

        match outcome {
            WaitOutcome::Ready(result) => Ok(Some(result?)),
            WaitOutcome::TimedOut { .. } => Ok(None),
        }
    }

    /// Wait for one confirmation in slices so the driver stays available to
    /// other callers (challenge refetches) between slices.
    async fn wait_phase(&self, phase: AuthPhase, budget: Duration) -> AuthResult<()> {
        let slice = self.config.poll_interval;
        let policy = RetryPolicy::new(slice, budget);
        let agent = &self.agent;
        let session_id = self.session_id.as_str();

        let outcome = wait_until(&policy, move |_| async move {
            if phase == AuthPhase::Authentication && agent.is_authenticated() {
                return Some(Ok(()));
            }
            let confirmed: DriverResult<bool> = match phase {
                AuthPhase::Authentication => agent.wait_authenticated(slice).await,
                AuthPhase::Ready => agent.wait_ready(slice).await,
            };
            match confirmed {
                Ok(true) => Some(Ok(())),
                Ok(false) => None,
                Err(err) if err.is_fatal() => Some(Err(err)),
                Err(err) => {
                    debug!("Session {}: {} wait failed: {}", session_id, phase, err);
                    None
                }
            }
        })
        .await;

        match outcome {
            WaitOutcome::Ready(result) => Ok(result?),
            WaitOutcome::TimedOut { .. } => {
                warn!(
                    "Session {}: {} not confirmed within {:?}",
                    self.session_id, phase, budget
                );
                Err(AuthError::Timeout { phase, budget })
            }
        }
    }

    async fn capture_phone_number(&self) -> Option<String> {
        match self.agent.phone_number().await {
            Ok(Some(phone)) => match self.registry.set_phone_number(&self.session_id, &phone) {
                Ok(_) => Some(phone),
                Err(err) => {
                    warn!("Session {}: storing phone number failed: {}", self.session_id, err);
                    None
                }
            },
            Ok(None) => {
                debug!("Session {}: driver did not report a phone number", self.session_id);
                None
            }
            Err(err) => {
                warn!("Session {}: reading phone number failed: {}", self.session_id, err);
                None
            }
        }
    }
}
