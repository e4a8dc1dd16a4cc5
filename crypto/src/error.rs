use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key encoding")]
    InvalidPublicKey,

    #[error("public key does not meet identity difficulty {0}")]
    InsufficientDifficulty(u32),
}
