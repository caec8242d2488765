use thiserror::Error;

use crate::Environment;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid environment: {0} (expected dev, staging or production)")]
    InvalidEnvironment(String),

    #[error("No image found: {0}")]
    NoImageFound(String),

    #[error("Image {id} is not available (state: {state})")]
    ImageNotAvailable { id: String, state: String },

    #[error("Invalid rollback target: {0}")]
    InvalidRollbackTarget(String),

    #[error("No previous image to roll back to in {0}")]
    NoPreviousImage(Environment),

    #[error("No current production image could be resolved for {0}")]
    NoCurrentImage(Environment),

    #[error("Rollback reason cannot be empty")]
    EmptyReason,

    #[error("More than one launch template is tagged Environment={0}")]
    AmbiguousTemplate(Environment),

    #[error("More than one fleet group is tagged Environment={0}")]
    AmbiguousFleet(Environment),

    #[error("Another promotion is in progress for {environment} (lease held by {holder})")]
    PromotionInProgress {
        environment: Environment,
        holder: String,
    },

    #[error("Rollback record already exists: {0}")]
    AuditCollision(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
