use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    /// The session token bytes were present but did not parse as a token.
    /// The request pipeline maps this to a 400-class response.
    #[error("malformed session token: {0}")]
    MalformedSessionToken(#[source] serde_json::Error),
}
