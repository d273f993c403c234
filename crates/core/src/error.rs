use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("request {0:?} is already tracked by the engine")]
    DuplicateRequest(String),

    #[error("unknown request {0:?}")]
    UnknownRequest(String),
}
