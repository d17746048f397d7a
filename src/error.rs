use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// Error type tasklet implementations return from `init` and `call`.
pub type TaskletError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("tasklet '{tasklet}' failed to initialize: {source}")]
    Init {
        tasklet: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("tasklet '{tasklet}' failed: {source}")]
    Call {
        tasklet: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("execution cancelled")]
    Cancelled,

    #[error("cancellation trigger completed normally instead of exceptionally")]
    IllegalTrigger,

    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("completion handles are read-only: {0}")]
    Unsupported(&'static str),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn init<S: Into<String>>(tasklet: S, source: TaskletError) -> Self {
        Error::Init {
            tasklet: tasklet.into(),
            source: Arc::from(source),
        }
    }

    pub fn call<S: Into<String>>(tasklet: S, source: TaskletError) -> Self {
        Error::Call {
            tasklet: tasklet.into(),
            source: Arc::from(source),
        }
    }

    pub fn rejected<S: Into<String>>(msg: S) -> Self {
        Error::Rejected(msg.into())
    }

    pub fn scheduler<S: Into<String>>(msg: S) -> Self {
        Error::Scheduler(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// True for outcomes caused by a cancellation request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Cause recorded when tasklet code panics instead of returning an error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("panicked: {0}")]
pub struct Panicked(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_error_carries_cause() {
        let cause: TaskletError = "disk gone".into();
        let err = Error::init("reader", cause);
        assert!(err.to_string().contains("reader"));
        assert!(err.to_string().contains("disk gone"));

        let source = std::error::Error::source(&err);
        assert_eq!(source.map(|s| s.to_string()), Some("disk gone".to_string()));
    }

    #[test]
    fn test_errors_clone() {
        let err = Error::call("mapper", Box::new(Panicked("boom".into())));
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn test_is_cancelled() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::IllegalTrigger.is_cancelled());
        assert!(!Error::rejected("full").is_cancelled());
    }
}
