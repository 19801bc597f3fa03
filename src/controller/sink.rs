//! Process-wide error sink
//!
//! Errors that will not be retried end up here so operators can see them.

use crate::domain::ports::ErrorSink;
use crate::error::Error;
use tracing::error;

/// Reports errors through the process log
#[derive(Debug, Clone, Default)]
pub struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn handle_error(&self, err: &Error) {
        error!(transient = err.is_transient(), "{}", err);
    }
}
