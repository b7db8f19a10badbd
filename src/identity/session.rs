//! Local session cache: a single file holding at most one non-expired session.
//!
//! File format is `base64(json) "." base64url(tag)` where the tag is a keyed BLAKE3 hash
//! of the JSON bytes. The key lives in a separate file created on first use.
//! Anything that fails to decode, fails the tag check, or has expired is deleted on load.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::principal::Identity;
use crate::config::Config;

pub fn session_ttl() -> Duration { Duration::hours(24) }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "user")]
    pub identity: Identity,
    #[serde(rename = "timestamp")]
    pub issued_at: DateTime<Utc>,
    #[serde(rename = "expires")]
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "remember_me")]
    pub remember: bool,
}

impl Session {
    pub fn new(identity: Identity, remember: bool, now: DateTime<Utc>) -> Self {
        Self { identity, issued_at: now, expires_at: now + session_ttl(), remember }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool { now < self.expires_at }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session file i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("session encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("session key: {0}")]
    Key(String),
}

#[derive(Clone)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self { Self(bytes) }

    pub fn generate() -> Result<Self, SessionError> {
        let mut buf = [0u8; 32];
        getrandom::getrandom(&mut buf).map_err(|e| SessionError::Key(e.to_string()))?;
        Ok(Self(buf))
    }

    /// Read the key file, or create it with a fresh random key.
    pub fn load_or_create(path: &Path) -> Result<Self, SessionError> {
        Ok(Self::load_or_replace(path)?.0)
    }

    /// As `load_or_create`, but an undecodable key file is regenerated in place.
    /// The flag reports that a replacement happened.
    fn load_or_replace(path: &Path) -> Result<(Self, bool), SessionError> {
        match fs::read_to_string(path) {
            Ok(text) => match Self::decode(&text) {
                Ok(key) => Ok((key, false)),
                Err(e) => {
                    warn!(target: "session", "unusable session key at {} ({}); generating a new one", path.display(), e);
                    Ok((Self::create(path)?, true))
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((Self::create(path)?, false)),
            Err(e) => Err(e.into()),
        }
    }

    fn decode(text: &str) -> Result<Self, SessionError> {
        let bytes = URL_SAFE_NO_PAD.decode(text.trim()).map_err(|e| SessionError::Key(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| SessionError::Key(format!("expected 32 key bytes, got {}", b.len())))?;
        Ok(Self(arr))
    }

    fn create(path: &Path) -> Result<Self, SessionError> {
        let key = Self::generate()?;
        write_replace(path, URL_SAFE_NO_PAD.encode(key.0).as_bytes())?;
        info!(target: "session", "created session key at {}", path.display());
        Ok(key)
    }

    fn tag(&self, payload: &[u8]) -> blake3::Hash { blake3::keyed_hash(&self.0, payload) }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("SessionKey(<redacted>)") }
}

/// Write to a sibling temp file, then rename over the target.
fn write_replace(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("session");
    let tmp = path.with_file_name(format!(".{}.tmp", name));
    {
        let mut f = fs::File::create(&tmp)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            f.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    key: SessionKey,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>, key: SessionKey) -> Self {
        Self { path: path.into(), key }
    }

    /// A replaced key cannot verify the existing session file, so that file is dropped.
    pub fn open(cfg: &Config) -> Result<Self, SessionError> {
        let (key, replaced) = SessionKey::load_or_replace(&cfg.session_key_file)?;
        let store = Self::new(cfg.session_file.clone(), key);
        if replaced {
            store.clear();
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn save(&self, identity: &Identity, remember: bool) -> Result<Session, SessionError> {
        self.save_at(identity, remember, Utc::now())
    }

    pub fn save_at(&self, identity: &Identity, remember: bool, now: DateTime<Utc>) -> Result<Session, SessionError> {
        let session = Session::new(identity.clone(), remember, now);
        self.save_session(&session)?;
        Ok(session)
    }

    pub fn save_session(&self, session: &Session) -> Result<(), SessionError> {
        let payload = serde_json::to_vec(session)?;
        write_replace(&self.path, self.seal(&payload).as_bytes())?;
        debug!(target: "session", "saved session for {} until {}", session.identity.email, session.expires_at);
        Ok(())
    }

    pub fn load(&self) -> Option<Session> { self.load_at(Utc::now()) }

    pub fn load_at(&self, now: DateTime<Utc>) -> Option<Session> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(target: "session", "session file unreadable: {}", e);
                return None;
            }
        };
        let Some(session) = self.open_sealed(&text) else {
            warn!(target: "session", "discarding malformed or tampered session file {}", self.path.display());
            self.clear();
            return None;
        };
        if !session.is_valid_at(now) {
            info!(target: "session", "session for {} expired at {}", session.identity.email, session.expires_at);
            self.clear();
            return None;
        }
        Some(session)
    }

    /// Idempotent; failures are logged and swallowed.
    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(target: "session", "cleared session file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(target: "session", "failed to clear session file: {}", e),
        }
    }

    fn seal(&self, payload: &[u8]) -> String {
        let tag = self.key.tag(payload);
        format!("{}.{}", STANDARD.encode(payload), URL_SAFE_NO_PAD.encode(tag.as_bytes()))
    }

    fn open_sealed(&self, text: &str) -> Option<Session> {
        let (body, tag) = text.trim().split_once('.')?;
        let payload = STANDARD.decode(body).ok()?;
        let tag: [u8; 32] = URL_SAFE_NO_PAD.decode(tag).ok()?.try_into().ok()?;
        // blake3::Hash equality is constant time
        if blake3::Hash::from(tag) != self.key.tag(&payload) {
            return None;
        }
        serde_json::from_slice(&payload).ok()
    }
}
