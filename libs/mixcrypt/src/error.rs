pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("openssl error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("message must be in the range [1, p): {0}")]
    MessageOutOfRange(String),

    #[error("ciphertext lies outside the group")]
    CiphertextOutOfRange,

    #[error("keys do not share the same group")]
    GroupMismatch,

    #[error("at least one authority is required")]
    NoAuthorities,

    #[error("key size must be at least {min} bits, got {bits}")]
    KeySizeTooSmall { bits: u32, min: u32 },

    #[error("invalid number: {0}")]
    InvalidNumber(String),
}
