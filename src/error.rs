//! Domain error taxonomy.
//!
//! Plumbing code returns [`anyhow::Result`]; the variants here are raised
//! where a failure has pipeline-level meaning and travel inside
//! `anyhow::Error`. Callers classify them with
//! [`anyhow::Error::downcast_ref`]:
//!
//! | Variant | Raised by | Effect |
//! |---------|-----------|--------|
//! | [`Validation`](HarnessError::Validation) | persistence mediator | that item fails, batch continues |
//! | [`PersistenceConflict`](HarnessError::PersistenceConflict) | stores | that item fails, batch continues |
//! | [`ChannelUnavailable`](HarnessError::ChannelUnavailable) | index channels | channel excluded from fusion |
//! | [`JudgeFailure`](HarnessError::JudgeFailure) | judges | neutral rerank score |
//! | [`ConfigurationMismatch`](HarnessError::ConfigurationMismatch) | identity binding | recorded identity wins |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid item '{path}': {reason}")]
    Validation { path: String, reason: String },

    #[error("persistence conflict on {scope}:{path}: {reason}")]
    PersistenceConflict {
        scope: String,
        path: String,
        reason: String,
    },

    #[error("channel '{channel}' unavailable: {reason}")]
    ChannelUnavailable { channel: String, reason: String },

    #[error("judge failure: {0}")]
    JudgeFailure(String),

    #[error(
        "dataset '{scope}' was embedded with {recorded} but configuration selects {configured}; using {recorded}"
    )]
    ConfigurationMismatch {
        scope: String,
        recorded: String,
        configured: String,
    },
}

impl HarnessError {
    pub fn validation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn channel_unavailable(channel: impl Into<String>, reason: impl ToString) -> Self {
        Self::ChannelUnavailable {
            channel: channel.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = HarnessError::validation("a.md", "empty path").into();
        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::Validation { path, .. }) => assert_eq!(path, "a.md"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_mismatch_message_names_both_identities() {
        let err = HarnessError::ConfigurationMismatch {
            scope: "notes".into(),
            recorded: "hash/hash-256".into(),
            configured: "openai/text-embedding-3-small".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("hash/hash-256"));
        assert!(msg.contains("openai/text-embedding-3-small"));
    }
}
