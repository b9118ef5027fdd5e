use std::fmt;

use strum::Display;

/// The step of an adapter call that failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    EnsureContainer,
    Persist,
    Derive,
    Read,
    Remove,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum StorageError {
    /// Rejected before any backend I/O happened.
    #[display("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// The directory or bucket meant to hold an object could not be established.
    #[display("impossible to create the container {path:?} for {key}: {reason}")]
    ContainerCreationFailed {
        key: String,
        path: String,
        reason: String,
    },

    /// Copying the bytes of the original or a variant failed partway.
    #[display("failed to {operation} {label} of {key}: {reason}")]
    TransferFailed {
        operation: Operation,
        key: String,
        label: String,
        reason: String,
    },

    /// Several objects of one call failed.
    ///
    /// Whatever was persisted before the failure stays on the backend.
    #[display("{} object(s) of {key} failed: {failures}", failures.len())]
    Partial { key: String, failures: Failures },

    /// A backend failure unrelated to the object being absent.
    #[display("backend failed to {operation} {label} of {key}: {reason}")]
    Backend {
        operation: Operation,
        key: String,
        label: String,
        reason: String,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn transfer(
        operation: Operation,
        key: &str,
        label: &str,
        reason: impl fmt::Display,
    ) -> Self {
        Self::TransferFailed {
            operation,
            key: key.to_string(),
            label: label.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn backend(
        operation: Operation,
        key: &str,
        label: &str,
        reason: impl fmt::Display,
    ) -> Self {
        Self::Backend {
            operation,
            key: key.to_string(),
            label: label.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Folds the failures of a multi-object call into a single error.
    ///
    /// Returns `None` when nothing failed. A single failure is returned as-is.
    pub fn collect(key: &str, mut failures: Vec<StorageError>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            _ => Some(Self::Partial {
                key: key.to_string(),
                failures: Failures(failures),
            }),
        }
    }

    /// The labels this error is about, `"o"` for the original.
    pub fn failed_labels(&self) -> Vec<&str> {
        match self {
            Self::TransferFailed { label, .. } | Self::Backend { label, .. } => {
                vec![label.as_str()]
            },
            Self::Partial { failures, .. } => failures
                .iter()
                .flat_map(|e| e.failed_labels())
                .collect(),
            _ => vec![],
        }
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput { .. })
    }
}

/// The individual failures of a multi-object call.
#[derive(Debug)]
pub struct Failures(Vec<StorageError>);

impl Failures {
    pub fn iter(&self) -> impl Iterator<Item = &StorageError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Failures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_single_failure_is_unwrapped() {
        let err = StorageError::transfer(Operation::Derive, "ab/cd.jpg", "thumb", "boom");
        let collected = StorageError::collect("ab/cd.jpg", vec![err]).unwrap();

        assert!(matches!(collected, StorageError::TransferFailed { .. }));
        assert_eq!(collected.failed_labels(), vec!["thumb"]);
    }

    #[test]
    fn test_collect_many_names_every_label() {
        let failures = vec![
            StorageError::transfer(Operation::Derive, "ab/cd.jpg", "small", "boom"),
            StorageError::transfer(Operation::Persist, "ab/cd.jpg", "large", "disk full"),
        ];
        let collected = StorageError::collect("ab/cd.jpg", failures).unwrap();

        let msg = collected.to_string();
        assert!(msg.starts_with("2 object(s) of ab/cd.jpg failed"));
        assert!(msg.contains("failed to derive small of ab/cd.jpg: boom"));
        assert!(msg.contains("failed to persist large of ab/cd.jpg: disk full"));
        assert_eq!(collected.failed_labels(), vec!["small", "large"]);
    }

    #[test]
    fn test_collect_nothing() {
        assert!(StorageError::collect("ab/cd.jpg", vec![]).is_none());
    }
}
