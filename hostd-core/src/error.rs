use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostdError {
    #[error("Resource exhausted for {resource_type}: {message}")]
    ResourceExhausted {
        resource_type: ResourceType,
        message: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    #[error("{tool} failed during {operation}: {message}")]
    ToolFailed {
        tool: String,
        operation: String,
        message: String,
    },

    #[error("Integrity check failed for {subject}: {message}")]
    Integrity { subject: String, message: String },

    #[error("{operation} failed and was rolled back: {cause}")]
    RolledBack {
        operation: String,
        cause: Box<HostdError>,
    },

    #[error("Network error during {operation}: {cause}")]
    NetworkError { operation: String, cause: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HostdError>;

impl HostdError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        HostdError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn tool(
        tool: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        HostdError::ToolFailed {
            tool: tool.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn rolled_back(operation: impl Into<String>, cause: HostdError) -> Self {
        HostdError::RolledBack {
            operation: operation.into(),
            cause: Box::new(cause),
        }
    }

    /// Resource exhaustion and transient network failures may succeed when
    /// the caller tries again; everything else is terminal for the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HostdError::ResourceExhausted { .. } | HostdError::NetworkError { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HostdError::NotFound { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    DeviceSlot,
    ImageCache,
    Disk,
    Storage,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::DeviceSlot => write!(f, "device slot"),
            ResourceType::ImageCache => write!(f, "image cache"),
            ResourceType::Disk => write!(f, "disk"),
            ResourceType::Storage => write!(f, "storage"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let exhausted = HostdError::ResourceExhausted {
            resource_type: ResourceType::DeviceSlot,
            message: "no free nbd device".to_string(),
        };
        assert!(exhausted.is_retryable());
        assert!(!HostdError::not_found("disk", "d-1").is_retryable());
        assert!(!HostdError::tool("qemu-img", "create", "boom").is_retryable());
    }

    #[test]
    fn test_rolled_back_keeps_cause() {
        let err = HostdError::rolled_back(
            "create snapshot",
            HostdError::tool("qemu-img", "create /data/d-1", "no space left"),
        );
        let text = err.to_string();
        assert!(text.contains("create snapshot"));
        assert!(text.contains("no space left"));
    }
}
