//! Login session persisted in `HELPME_HOME/session.json`

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const SESSION_FILE: &str = "session.json";

/// How long a token is honoured after it is stored
pub const TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Profile of the logged-in user. Fields the backend adds are kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub nickname: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthSession {
    token: Option<String>,
    expires_at_millis: Option<u64>,
    user: Option<UserInfo>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("could not determine home directory")]
    NoHome,
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt session file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// `$HELPME_HOME`, or `~/.helpme`
pub fn helpme_home() -> Result<PathBuf, SessionStoreError> {
    match std::env::var("HELPME_HOME") {
        Ok(home) => Ok(PathBuf::from(home)),
        Err(_) => dirs::home_dir()
            .map(|h| h.join(".helpme"))
            .ok_or(SessionStoreError::NoHome),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn open_default() -> Result<Self, SessionStoreError> {
        Ok(Self::at(helpme_home()?.join(SESSION_FILE)))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store `token`, valid for [`TOKEN_TTL`] from now.
    pub fn set_token(&self, token: &str) -> Result<(), SessionStoreError> {
        let mut session = self.load()?;
        session.token = Some(token.to_string());
        session.expires_at_millis = Some(now_millis() + TOKEN_TTL.as_millis() as u64);
        self.save(&session)
    }

    /// The stored token, expired or not
    pub fn token(&self) -> Result<Option<String>, SessionStoreError> {
        Ok(self.load()?.token)
    }

    /// The stored token if the session is still valid
    pub fn valid_token(&self) -> Result<Option<String>, SessionStoreError> {
        if self.is_logged_in()? {
            self.token()
        } else {
            Ok(None)
        }
    }

    pub fn set_user(&self, user: UserInfo) -> Result<(), SessionStoreError> {
        let mut session = self.load()?;
        session.user = Some(user);
        self.save(&session)
    }

    pub fn user(&self) -> Result<Option<UserInfo>, SessionStoreError> {
        Ok(self.load()?.user)
    }

    pub fn expires_at(&self) -> Result<Option<SystemTime>, SessionStoreError> {
        Ok(self
            .load()?
            .expires_at_millis
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms)))
    }

    /// A token is stored and has not expired. An expired session is cleared.
    pub fn is_logged_in(&self) -> Result<bool, SessionStoreError> {
        let session = self.load()?;
        if session.token.is_none() {
            return Ok(false);
        }
        match session.expires_at_millis {
            Some(expires) if now_millis() <= expires => Ok(true),
            _ => {
                log::info!("session expired");
                self.clear()?;
                Ok(false)
            }
        }
    }

    pub fn clear(&self) -> Result<(), SessionStoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn load(&self) -> Result<AuthSession, SessionStoreError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AuthSession::default()),
            Err(source) => return Err(self.io_error(source)),
        };
        serde_json::from_str(&data).map_err(|source| SessionStoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, session: &AuthSession) -> Result<(), SessionStoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|source| self.io_error(source))?;
        }
        let data = serde_json::to_string_pretty(session).map_err(|source| SessionStoreError::Parse {
            path: self.path.clone(),
            source,
        })?;
        fs::write(&self.path, data).map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: std::io::Error) -> SessionStoreError {
        SessionStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
