use thiserror::Error;

/// Errors produced while building or running a flow.
///
/// Every variant carries a human-readable message and, when known, the name
/// of the flow that raised it. `Display` renders the bare message so that
/// error text stays stable for callers that match on it; attribution is
/// available through [`FlowError::flow_name`]. The enum itself is the
/// catch-all kind: handlers that do not care which category failed match on
/// `FlowError` as a whole.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    /// An item failed a guard predicate.
    #[error("{message}")]
    Validation {
        message: String,
        flow: Option<String>,
    },

    /// A downstream operation failed irrecoverably: retries exhausted, all
    /// racers failed, circuit open, task panicked.
    #[error("{message}")]
    Execution {
        message: String,
        flow: Option<String>,
    },

    /// A bounded wait elapsed.
    #[error("{message}")]
    Timeout {
        message: String,
        flow: Option<String>,
    },

    /// A flow was built with invalid parameters.
    #[error("{message}")]
    Configuration {
        message: String,
        flow: Option<String>,
    },

    /// A flow or stream was used in a way its contract forbids, e.g. a
    /// single-use input stream consumed by a second application.
    #[error("{message}")]
    Misuse {
        message: String,
        flow: Option<String>,
    },
}

impl FlowError {
    pub fn validation(message: impl Into<String>) -> Self {
        FlowError::Validation {
            message: message.into(),
            flow: None,
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        FlowError::Execution {
            message: message.into(),
            flow: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        FlowError::Timeout {
            message: message.into(),
            flow: None,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        FlowError::Configuration {
            message: message.into(),
            flow: None,
        }
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        FlowError::Misuse {
            message: message.into(),
            flow: None,
        }
    }

    /// Attach the originating flow name, unless one is already recorded.
    pub fn with_flow(mut self, name: &str) -> Self {
        let slot = match &mut self {
            FlowError::Validation { flow, .. }
            | FlowError::Execution { flow, .. }
            | FlowError::Timeout { flow, .. }
            | FlowError::Configuration { flow, .. }
            | FlowError::Misuse { flow, .. } => flow,
        };
        if slot.is_none() {
            *slot = Some(name.to_string());
        }
        self
    }

    /// The flow this error was attributed to, if known.
    pub fn flow_name(&self) -> Option<&str> {
        match self {
            FlowError::Validation { flow, .. }
            | FlowError::Execution { flow, .. }
            | FlowError::Timeout { flow, .. }
            | FlowError::Configuration { flow, .. }
            | FlowError::Misuse { flow, .. } => flow.as_deref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Validation { .. } => "validation",
            FlowError::Execution { .. } => "execution",
            FlowError::Timeout { .. } => "timeout",
            FlowError::Configuration { .. } => "configuration",
            FlowError::Misuse { .. } => "misuse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_bare_message() {
        let err = FlowError::validation("neg: -1").with_flow("guard");
        assert_eq!(err.to_string(), "neg: -1");
        assert_eq!(err.flow_name(), Some("guard"));
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_with_flow_keeps_first_attribution() {
        let err = FlowError::timeout("no item within 50ms")
            .with_flow("timeout")
            .with_flow("outer");
        assert_eq!(err.flow_name(), Some("timeout"));
    }
}
