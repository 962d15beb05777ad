use domain::{DomainError, RepositoryError};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("infrastructure error: {message}")]
    Infrastructure {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("authentication failed")]
    Authentication,
}

/// 对外暴露的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure {
            message: message.into(),
            source: None,
        }
    }

    pub fn infrastructure_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ApplicationError::Infrastructure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn forbidden(action: impl Into<String>) -> Self {
        ApplicationError::Domain(DomainError::permission_denied(action))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApplicationError::Domain(DomainError::ValidationError { .. }) => ErrorKind::Validation,
            ApplicationError::Domain(DomainError::PermissionDenied { .. }) => ErrorKind::Forbidden,
            ApplicationError::Domain(DomainError::ResourceNotFound { .. }) => ErrorKind::NotFound,
            ApplicationError::Repository(RepositoryError::NotFound) => ErrorKind::NotFound,
            ApplicationError::Repository(_) => ErrorKind::Internal,
            ApplicationError::Infrastructure { .. } => ErrorKind::Internal,
            ApplicationError::Authentication => ErrorKind::Unauthorized,
        }
    }

    /// 返回给客户端的错误描述，内部错误不暴露细节
    pub fn client_message(&self) -> String {
        match self {
            ApplicationError::Domain(DomainError::ValidationError { field, message }) => {
                format!("{field}: {message}")
            }
            ApplicationError::Domain(DomainError::PermissionDenied { action }) => action.clone(),
            ApplicationError::Domain(DomainError::ResourceNotFound { resource_type, .. }) => {
                format!("{resource_type} not found")
            }
            ApplicationError::Repository(RepositoryError::NotFound) => {
                "requested resource not found".to_string()
            }
            ApplicationError::Authentication => "authentication failed".to_string(),
            ApplicationError::Repository(_) | ApplicationError::Infrastructure { .. } => {
                "internal error".to_string()
            }
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}
