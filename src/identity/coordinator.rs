//! Sign-in / sign-out / resume contract consumed by the interactive shell.
//!
//! The coordinator itself is a plain `&mut self` state machine. `spawn` moves it onto a
//! tokio task so the shell's own loop only ever sees completed results as messages.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::principal::{AccessToken, Credential, Identity};
use super::provider::{AuthError, IdentityClient};
use super::session::{Session, SessionStore};
use crate::net::{connection_status, ConnectionStatus, Reachability};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated(Identity),
    Failed(AuthError),
}

/// Local preconditions checked before any network call.
pub fn validate_credential(credential: &Credential) -> Result<(), AuthError> {
    if credential.email.is_empty() || credential.secret.is_empty() {
        return Err(AuthError::MissingFields);
    }
    if !credential.email.contains('@') {
        return Err(AuthError::InvalidEmail);
    }
    Ok(())
}

pub struct AuthCoordinator {
    net: Arc<dyn Reachability>,
    identity: Arc<IdentityClient>,
    store: SessionStore,
    session: Option<Session>,
    last_error: Option<AuthError>,
    state: watch::Sender<AuthState>,
}

impl AuthCoordinator {
    pub fn new(net: Arc<dyn Reachability>, identity: Arc<IdentityClient>, store: SessionStore) -> Self {
        let (state, _) = watch::channel(AuthState::Unauthenticated);
        Self { net, identity, store, session: None, last_error: None, state }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> { self.state.subscribe() }

    pub fn state(&self) -> AuthState { self.state.borrow().clone() }

    pub fn session(&self) -> Option<&Session> { self.session.as_ref() }

    pub fn last_error(&self) -> Option<&AuthError> { self.last_error.as_ref() }

    /// Token of the live sign-in; a resumed session has none.
    pub fn access_token(&self) -> Option<AccessToken> { self.identity.current().map(|s| s.access_token) }

    fn transition(&self, next: AuthState) {
        debug!(target: "auth", "state -> {:?}", next);
        self.state.send_replace(next);
    }

    /// Silent resume from a remembered, unexpired session. Never touches the network.
    pub fn resume(&mut self) -> Option<Identity> {
        let session = self.store.load()?;
        if !session.remember {
            debug!(target: "auth", "stored session not marked remember; ignoring");
            return None;
        }
        info!(target: "auth", "resumed session for {}", session.identity.email);
        let identity = session.identity.clone();
        self.session = Some(session);
        self.transition(AuthState::Authenticated(identity.clone()));
        Some(identity)
    }

    pub async fn sign_in(&mut self, email: &str, secret: &str, remember: bool) -> Result<Identity, AuthError> {
        let credential = Credential::new(email, secret);
        if let Err(e) = validate_credential(&credential) {
            self.last_error = Some(e.clone());
            return Err(e);
        }
        // A new attempt supersedes whatever sign-in was live before it.
        self.identity.sign_out();
        self.session = None;
        self.transition(AuthState::Authenticating);

        let outcome = if self.net.has_internet().await {
            self.identity.sign_in(&credential.email, &credential.secret).await
        } else {
            Err(AuthError::NoConnection)
        };

        match outcome {
            Ok(sign_in) => {
                let session = Session::new(sign_in.identity.clone(), remember, chrono::Utc::now());
                if remember {
                    if let Err(e) = self.store.save_session(&session) {
                        warn!(target: "auth", "could not persist session: {}", e);
                    }
                } else {
                    self.store.clear();
                }
                self.session = Some(session);
                self.last_error = None;
                self.transition(AuthState::Authenticated(sign_in.identity.clone()));
                Ok(sign_in.identity)
            }
            Err(e) => {
                self.last_error = Some(e.clone());
                self.transition(AuthState::Failed(e.clone()));
                self.transition(AuthState::Unauthenticated);
                Err(e)
            }
        }
    }

    pub fn sign_out(&mut self) {
        self.identity.sign_out();
        self.store.clear();
        self.session = None;
        self.transition(AuthState::Unauthenticated);
        info!(target: "auth", "signed out");
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        connection_status(self.net.as_ref()).await
    }
}

#[derive(Debug)]
pub enum AuthCommand {
    Resume,
    SignIn { credential: Credential, remember: bool },
    SignOut,
    CheckConnection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    Resumed(Option<Identity>),
    SignedIn(Result<Identity, AuthError>),
    SignedOut,
    Connection(ConnectionStatus),
}

/// Shell-side end of a coordinator running on its own task.
pub struct AuthHandle {
    commands: mpsc::Sender<AuthCommand>,
    events: mpsc::Receiver<AuthEvent>,
    state: watch::Receiver<AuthState>,
    task: JoinHandle<AuthCoordinator>,
}

impl AuthHandle {
    /// Queue a command. Commands run one at a time, so at most one sign-in is ever in flight.
    pub async fn send(&self, cmd: AuthCommand) -> bool { self.commands.send(cmd).await.is_ok() }

    pub async fn next_event(&mut self) -> Option<AuthEvent> { self.events.recv().await }

    pub fn state(&self) -> watch::Receiver<AuthState> { self.state.clone() }

    /// Stop the worker and get the coordinator back.
    pub async fn shutdown(self) -> Option<AuthCoordinator> {
        drop(self.commands);
        self.task.await.ok()
    }
}

pub fn spawn(mut coordinator: AuthCoordinator) -> AuthHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<AuthCommand>(8);
    let (evt_tx, evt_rx) = mpsc::channel::<AuthEvent>(8);
    let state = coordinator.subscribe();
    let task = tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            let event = match cmd {
                AuthCommand::Resume => AuthEvent::Resumed(coordinator.resume()),
                AuthCommand::SignIn { credential, remember } => {
                    AuthEvent::SignedIn(coordinator.sign_in(&credential.email, &credential.secret, remember).await)
                }
                AuthCommand::SignOut => {
                    coordinator.sign_out();
                    AuthEvent::SignedOut
                }
                AuthCommand::CheckConnection => AuthEvent::Connection(coordinator.connection_status().await),
            };
            if evt_tx.send(event).await.is_err() {
                break;
            }
        }
        coordinator
    });
    AuthHandle { commands: cmd_tx, events: evt_rx, state, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::provider::{CredentialVerifier, StageOutcome};
    use crate::identity::session::SessionKey;
    use crate::identity::{SignIn, VerificationMethod};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeNet {
        online: bool,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl Reachability for FakeNet {
        async fn has_internet(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.online
        }
        async fn has_backend(&self) -> bool { self.online }
    }

    /// Accepts any credential while `accept` is set, except the secret "wrong".
    struct FakeVerifier {
        accept: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialVerifier for FakeVerifier {
        fn method(&self) -> VerificationMethod { VerificationMethod::RemoteAuth }
        async fn attempt(&self, credential: &Credential) -> StageOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.accept || credential.secret == "wrong" {
                return StageOutcome::Rejected("no".into());
            }
            StageOutcome::Accepted(SignIn {
                identity: Identity {
                    id: format!("u-{}", credential.email),
                    email: credential.email.clone(),
                    verification_method: VerificationMethod::RemoteAuth,
                    created_at: chrono::Utc::now(),
                },
                access_token: AccessToken::Bearer(format!("tok-{}", credential.email)),
                method: VerificationMethod::RemoteAuth,
            })
        }
        async fn verify(&self, _token: &AccessToken) -> Option<Identity> { None }
    }

    struct Rig {
        _tmp: tempfile::TempDir,
        net: Arc<FakeNet>,
        verifier: Arc<FakeVerifier>,
        coordinator: AuthCoordinator,
    }

    fn rig(online: bool, accept: bool) -> Rig {
        let tmp = tempfile::tempdir().unwrap();
        let net = Arc::new(FakeNet { online, probes: AtomicUsize::new(0) });
        let verifier = Arc::new(FakeVerifier { accept, calls: AtomicUsize::new(0) });
        let strategies: Vec<Arc<dyn CredentialVerifier>> = vec![verifier.clone()];
        let identity = Arc::new(IdentityClient::with_verifiers(strategies));
        let store = SessionStore::new(tmp.path().join(".session_data"), SessionKey::from_bytes([1u8; 32]));
        let coordinator = AuthCoordinator::new(net.clone(), identity, store);
        Rig { _tmp: tmp, net, verifier, coordinator }
    }

    #[tokio::test]
    async fn malformed_email_rejected_before_network() {
        let mut r = rig(true, true);
        assert_eq!(r.coordinator.sign_in("no-at-sign", "pw", false).await, Err(AuthError::InvalidEmail));
        assert_eq!(r.coordinator.sign_in("", "pw", false).await, Err(AuthError::MissingFields));
        assert_eq!(r.net.probes.load(Ordering::SeqCst), 0);
        assert_eq!(r.verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn offline_fails_fast_and_allows_retry() {
        let mut r = rig(false, true);
        let err = r.coordinator.sign_in("a@b.com", "pw", true).await.unwrap_err();
        assert_eq!(err, AuthError::NoConnection);
        assert_eq!(r.verifier.calls.load(Ordering::SeqCst), 0);
        assert_eq!(r.coordinator.state(), AuthState::Unauthenticated);
        assert_eq!(r.coordinator.last_error(), Some(&AuthError::NoConnection));
    }

    #[tokio::test]
    async fn remembered_sign_in_persists_and_resumes_offline() {
        let mut r = rig(true, true);
        let id = r.coordinator.sign_in("a@b.com", "pw", true).await.unwrap();
        assert_eq!(r.coordinator.state(), AuthState::Authenticated(id.clone()));
        assert!(r.coordinator.store.path().exists());

        // A fresh coordinator over the same file resumes without any probe or strategy call.
        let store = SessionStore::new(r.coordinator.store.path().to_path_buf(), SessionKey::from_bytes([1u8; 32]));
        let net = Arc::new(FakeNet { online: false, probes: AtomicUsize::new(0) });
        let verifier = Arc::new(FakeVerifier { accept: false, calls: AtomicUsize::new(0) });
        let strategies: Vec<Arc<dyn CredentialVerifier>> = vec![verifier.clone()];
        let mut again = AuthCoordinator::new(net.clone(), Arc::new(IdentityClient::with_verifiers(strategies)), store);
        assert_eq!(again.resume(), Some(id.clone()));
        assert_eq!(again.state(), AuthState::Authenticated(id));
        assert!(again.access_token().is_none());
        assert_eq!(net.probes.load(Ordering::SeqCst), 0);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ephemeral_sign_in_is_not_persisted() {
        let mut r = rig(true, true);
        r.coordinator.sign_in("a@b.com", "pw", false).await.unwrap();
        assert!(!r.coordinator.store.path().exists());
        assert!(r.coordinator.session().is_some());
        assert_eq!(r.coordinator.access_token(), Some(AccessToken::Bearer("tok-a@b.com".into())));
        assert!(r.coordinator.resume().is_none());
    }

    #[tokio::test]
    async fn ephemeral_sign_in_replaces_a_remembered_one() {
        let mut r = rig(true, true);
        r.coordinator.sign_in("first@b.com", "pw", true).await.unwrap();
        assert!(r.coordinator.store.path().exists());
        let second = r.coordinator.sign_in("second@b.com", "pw", false).await.unwrap();
        assert_eq!(r.coordinator.state(), AuthState::Authenticated(second));
        assert!(!r.coordinator.store.path().exists());

        let store = SessionStore::new(r.coordinator.store.path().to_path_buf(), SessionKey::from_bytes([1u8; 32]));
        let strategies: Vec<Arc<dyn CredentialVerifier>> = vec![r.verifier.clone()];
        let mut next = AuthCoordinator::new(r.net.clone(), Arc::new(IdentityClient::with_verifiers(strategies)), store);
        assert!(next.resume().is_none());
    }

    #[tokio::test]
    async fn failed_sign_in_drops_the_previous_one() {
        let mut r = rig(true, true);
        r.coordinator.sign_in("first@b.com", "pw", false).await.unwrap();
        assert!(r.coordinator.access_token().is_some());

        let err = r.coordinator.sign_in("second@b.com", "wrong", false).await.unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
        assert_eq!(r.coordinator.state(), AuthState::Unauthenticated);
        assert!(r.coordinator.access_token().is_none());
        assert!(r.coordinator.session().is_none());
    }

    #[tokio::test]
    async fn unremembered_file_does_not_resume() {
        let mut r = rig(true, true);
        let identity = Identity {
            id: "u-1".into(),
            email: "a@b.com".into(),
            verification_method: VerificationMethod::TableLookup,
            created_at: chrono::Utc::now(),
        };
        r.coordinator.store.save(&identity, false).unwrap();
        assert!(r.coordinator.resume().is_none());
        assert_eq!(r.coordinator.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn sign_out_clears_everything() {
        let mut r = rig(true, true);
        r.coordinator.sign_in("a@b.com", "pw", true).await.unwrap();
        r.coordinator.sign_out();
        assert_eq!(r.coordinator.state(), AuthState::Unauthenticated);
        assert!(r.coordinator.session().is_none());
        assert!(r.coordinator.access_token().is_none());
        assert!(!r.coordinator.store.path().exists());
    }

    #[tokio::test]
    async fn worker_posts_completed_results() {
        let r = rig(true, false);
        let mut handle = spawn(r.coordinator);
        assert!(handle.send(AuthCommand::SignIn { credential: Credential::new("a@b.com", "pw"), remember: false }).await);
        assert_eq!(handle.next_event().await, Some(AuthEvent::SignedIn(Err(AuthError::InvalidCredentials))));
        assert!(handle.send(AuthCommand::CheckConnection).await);
        assert_eq!(handle.next_event().await, Some(AuthEvent::Connection(ConnectionStatus::Ready)));
        assert_eq!(*handle.state().borrow(), AuthState::Unauthenticated);
        let back = handle.shutdown().await.unwrap();
        assert_eq!(back.last_error(), Some(&AuthError::InvalidCredentials));
    }
}
