//! Default session token wrapper.

use crate::application::ports::TokenWrapper;
use crate::domain::session::SessionId;

/// Hands out the raw session id as the token.
///
/// Only ids shaped like the ones the session manager generates (64 lowercase
/// hex characters) are accepted back.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTokens;

impl PlainTokens {
    /// Create a new wrapper.
    pub fn new() -> Self {
        Self
    }
}

impl TokenWrapper for PlainTokens {
    fn wrap(&self, id: &SessionId) -> String {
        id.as_str().to_string()
    }

    fn unwrap(&self, token: &str) -> Option<SessionId> {
        let well_formed = token.len() == 64
            && token
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| SessionId::new(token))
    }
}
