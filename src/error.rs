use thiserror::Error;

use crate::history::HistoryError;

/// Failures surfaced by the interactions controller.
#[derive(Debug, Error)]
pub enum InteractionError {
    #[error("nothing to evaluate: input is empty")]
    InvalidInput,
    #[error("interpreter failed to start: {0}")]
    SlaveStartup(String),
    #[error("interpreter terminated unexpectedly: {0}")]
    SlaveCrashed(String),
    #[error("evaluation interrupted")]
    Interrupted,
    #[error("request cancelled by interpreter reset")]
    Cancelled,
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("interactions controller has shut down")]
    ShutDown,
}

impl InteractionError {
    /// Short label used in events and the debug log.
    pub fn kind(&self) -> &'static str {
        match self {
            InteractionError::InvalidInput => "invalid_input",
            InteractionError::SlaveStartup(_) => "slave_startup",
            InteractionError::SlaveCrashed(_) => "slave_crashed",
            InteractionError::Interrupted => "interrupted",
            InteractionError::Cancelled => "cancelled",
            InteractionError::History(_) => "history",
            InteractionError::ShutDown => "shut_down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_errors_convert_transparently() {
        let err: InteractionError = HistoryError::Malformed {
            line: 3,
            reason: "bad".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "history");
        assert_eq!(err.to_string(), "malformed history at line 3: bad");
    }
}
