use passpool_core::repository::StoreError;
use passpool_core::schedule::NotJoinableReason;
use passpool_core::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("Rider already joined this trip")]
    AlreadyJoined,

    #[error("Rider has not joined this trip")]
    NotJoined,

    #[error("Trip is not joinable: {0:?}")]
    TripNotJoinable(NotJoinableReason),

    #[error("Could not apply group changes after {attempts} attempts, retry later")]
    RebalanceConflict { attempts: u32 },

    #[error("Group already has a steward")]
    StewardAlreadyAssigned,

    #[error("Only the group steward can do this")]
    NotSteward,

    #[error("This pass is already registered to another group")]
    DuplicatePass,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CoreError> for GroupError {
    fn from(err: CoreError) -> Self {
        GroupError::Internal(err.to_string())
    }
}

impl From<StoreError> for GroupError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => GroupError::RebalanceConflict { attempts: 1 },
            StoreError::DuplicatePass(_) => GroupError::DuplicatePass,
            other => GroupError::Internal(other.to_string()),
        }
    }
}

pub type GroupResult<T> = Result<T, GroupError>;
