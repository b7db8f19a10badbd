//! Operator identity: credential verification, token checks and the local session cache.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
pub mod secret;
mod provider;
mod session;
mod coordinator;

pub use principal::{AccessToken, Credential, Identity, SignIn, VerificationMethod, TABLE_AUTH_PREFIX};
pub use provider::{
    AuthError, CredentialVerifier, IdentityClient, RemoteAuthVerifier, StageOutcome, TableLookupVerifier, TokenVerifier,
};
pub use session::{session_ttl, Session, SessionError, SessionKey, SessionStore};
pub use coordinator::{spawn, validate_credential, AuthCommand, AuthCoordinator, AuthEvent, AuthHandle, AuthState};
