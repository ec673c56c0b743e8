use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("consensus rule violation: {0}")]
    RuleViolation(String),

    #[error("malformed consensus data: {0}")]
    MalformedData(String),
}
