//! Who may open a socket, and with which rights.

use std::collections::HashMap;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine};

/// Scope entry admitting unauthenticated users.
pub const ANONYMOUS: &str = "(anon)";
/// Scope entry admitting any authenticated user.
pub const AUTHENTICATED: &str = "(authenticated)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Readers,
    Writers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// `None` is an anonymous request.
    Authenticated(Option<String>),
    Rejected,
}

pub trait AuthGate: Send + Sync {
    fn authenticate_request(&self, headers: &HeaderMap) -> AuthDecision;
    fn is_authorized(&self, scope: Scope, username: Option<&str>) -> bool;
}

/// HTTP Basic credentials checked against a fixed table.
#[derive(Debug, Clone, Default)]
pub struct BasicAuthGate {
    credentials: HashMap<String, String>,
    readers: Vec<String>,
    writers: Vec<String>,
}

impl BasicAuthGate {
    pub fn new(
        credentials: HashMap<String, String>,
        readers: Vec<String>,
        writers: Vec<String>,
    ) -> Self {
        Self { credentials, readers, writers }
    }

    /// Everyone, including anonymous users, may read and write.
    pub fn open() -> Self {
        Self::new(HashMap::new(), vec![ANONYMOUS.into()], vec![ANONYMOUS.into()])
    }

    fn decode_basic(header: &str) -> Option<(String, String)> {
        let encoded = header.strip_prefix("Basic ")?.trim();
        let decoded = STANDARD.decode(encoded).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some((user.to_owned(), password.to_owned()))
    }
}

impl AuthGate for BasicAuthGate {
    fn authenticate_request(&self, headers: &HeaderMap) -> AuthDecision {
        let Some(header) = headers.get(AUTHORIZATION) else {
            return AuthDecision::Authenticated(None);
        };
        let Some((user, password)) = header.to_str().ok().and_then(Self::decode_basic) else {
            return AuthDecision::Rejected;
        };
        match self.credentials.get(&user) {
            Some(expected) if *expected == password => AuthDecision::Authenticated(Some(user)),
            _ => AuthDecision::Rejected,
        }
    }

    fn is_authorized(&self, scope: Scope, username: Option<&str>) -> bool {
        let allowed = match scope {
            Scope::Readers => &self.readers,
            Scope::Writers => &self.writers,
        };
        allowed.iter().any(|entry| match username {
            _ if entry == ANONYMOUS => true,
            Some(user) => entry == AUTHENTICATED || entry == user,
            None => false,
        })
    }
}
