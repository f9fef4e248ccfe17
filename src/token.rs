use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionTokens {
    pub session_token: String,
    pub master_token: String,
    pub session_id: i64,
}

/// Holder of the session token triple.
///
/// Reads and writes go through a read-write lock so the triple is always observed as a
/// unit. [`TokenAccessor::lock`] is a separate exclusive section that serializes renewals
/// across concurrent callers.
#[derive(Debug, Default)]
pub struct TokenAccessor {
    tokens: RwLock<SessionTokens>,
    renewal: Arc<Mutex<()>>,
}

impl TokenAccessor {
    pub fn new(session_token: &str, master_token: &str, session_id: i64) -> Self {
        Self {
            tokens: RwLock::new(SessionTokens {
                session_token: session_token.to_string(),
                master_token: master_token.to_string(),
                session_id,
            }),
            renewal: Arc::new(Mutex::new(())),
        }
    }

    pub fn get(&self) -> SessionTokens {
        match self.tokens.read() {
            Ok(tokens) => tokens.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn session_token(&self) -> String {
        self.get().session_token
    }

    pub fn set(&self, session_token: &str, master_token: &str, session_id: i64) {
        let mut tokens = match self.tokens.write() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };
        *tokens = SessionTokens {
            session_token: session_token.to_string(),
            master_token: master_token.to_string(),
            session_id,
        };
    }

    /// Enters the renewal critical section; it is left when the guard is dropped.
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.renewal).lock_owned().await
    }

    pub(crate) fn clear(&self) {
        self.set("", "", 0);
    }
}
