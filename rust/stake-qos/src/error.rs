//! Error taxonomy
//!
//! Only `Config` and `CollaboratorInit` stop the process. Fetch errors cost
//! a tick, parse errors cost a node, and rule mutation errors are logged and
//! left for the next tick to repair.

/// Errors raised by the reconciliation engine and its collaborators
#[derive(Debug, Clone, thiserror::Error)]
pub enum QosError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{collaborator} initialisation failed: {reason}")]
    CollaboratorInit {
        collaborator: &'static str,
        reason: String,
    },

    #[error("fetching {what} failed: {reason}")]
    Fetch { what: &'static str, reason: String },

    #[error("couldn't parse address {address:?}: {reason}")]
    AddressParse { address: String, reason: String },

    #[error("couldn't parse port of {address:?}: {reason}")]
    PortParse { address: String, reason: String },

    #[error("`{command}` failed: {reason}")]
    RuleMutation { command: String, reason: String },
}

impl QosError {
    pub fn config(reason: impl Into<String>) -> Self {
        QosError::Config(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, QosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_errors_name_the_collaborator() {
        let err = QosError::CollaboratorInit {
            collaborator: "iptables",
            reason: "missing".into(),
        };
        assert_eq!(err.to_string(), "iptables initialisation failed: missing");
        assert_eq!(
            QosError::config("bad").to_string(),
            "configuration error: bad"
        );
    }

    #[test]
    fn test_messages_carry_context() {
        let err = QosError::AddressParse {
            address: "nonsense".into(),
            reason: "invalid socket address syntax".into(),
        };
        assert!(err.to_string().contains("nonsense"));
    }
}
