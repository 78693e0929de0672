use std::process::ExitCode;

/// Errors that cause tandem to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("event rejected: {0}")]
    SignatureRejected(String),

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub const fn code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::ToolNotFound { .. } => 3,
            Self::ToolFailed { .. } => 4,
            Self::Timeout { .. } => 5,
            Self::SignatureRejected(_) => 6,
            Self::Other(_) => 1,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(ExitError::Config("x".into()).code(), 2);
        assert_eq!(ExitError::ToolNotFound { tool: "gh".into() }.code(), 3);
        assert_eq!(
            ExitError::Timeout {
                tool: "tandem-agent".into(),
                timeout_secs: 5
            }
            .code(),
            5
        );
        assert_eq!(ExitError::SignatureRejected("bad digest".into()).code(), 6);
        assert_eq!(ExitError::Other("x".into()).code(), 1);
    }

    #[test]
    fn messages_name_the_tool() {
        let err = ExitError::ToolFailed {
            tool: "gh".into(),
            code: 1,
            message: "HTTP 404".into(),
        };
        assert_eq!(err.to_string(), "gh failed (exit 1): HTTP 404");
    }
}
