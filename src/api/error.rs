//! MEGA API error codes.

use crate::error::MegaError;

/// Negative integer codes returned by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    /// Internal server error
    Internal = -1,
    /// Invalid arguments
    Args = -2,
    /// Temporary congestion, retry the whole batch
    Again = -3,
    /// Rate limit exceeded, retry with backoff
    RateLimit = -4,
    /// Upload failed
    Failed = -5,
    /// Too many concurrent IPs
    TooMany = -6,
    /// Out of range
    Range = -7,
    /// Resource expired or version clash
    Expired = -8,
    /// Resource does not exist
    NotFound = -9,
    /// Circular linking
    Circular = -10,
    /// Access denied
    Access = -11,
    /// Resource already exists
    Exists = -12,
    /// Request incomplete
    Incomplete = -13,
    /// Cryptographic error on the server side
    Key = -14,
    /// Session id invalid or expired
    Sid = -15,
    /// Account blocked
    Blocked = -16,
    /// Storage quota exceeded
    OverQuota = -17,
    /// Resource temporarily unavailable
    TempUnavail = -18,
    /// Unrecognized code
    Unknown = -9999,
}

impl From<i64> for ApiErrorCode {
    fn from(code: i64) -> Self {
        match code {
            -1 => ApiErrorCode::Internal,
            -2 => ApiErrorCode::Args,
            -3 => ApiErrorCode::Again,
            -4 => ApiErrorCode::RateLimit,
            -5 => ApiErrorCode::Failed,
            -6 => ApiErrorCode::TooMany,
            -7 => ApiErrorCode::Range,
            -8 => ApiErrorCode::Expired,
            -9 => ApiErrorCode::NotFound,
            -10 => ApiErrorCode::Circular,
            -11 => ApiErrorCode::Access,
            -12 => ApiErrorCode::Exists,
            -13 => ApiErrorCode::Incomplete,
            -14 => ApiErrorCode::Key,
            -15 => ApiErrorCode::Sid,
            -16 => ApiErrorCode::Blocked,
            -17 => ApiErrorCode::OverQuota,
            -18 => ApiErrorCode::TempUnavail,
            _ => ApiErrorCode::Unknown,
        }
    }
}

impl ApiErrorCode {
    /// Human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            ApiErrorCode::Internal => "Internal server error",
            ApiErrorCode::Args => "Invalid arguments",
            ApiErrorCode::Again => "Temporary congestion, try again",
            ApiErrorCode::RateLimit => "Rate limit exceeded",
            ApiErrorCode::Failed => "Request failed permanently",
            ApiErrorCode::TooMany => "Too many concurrent connections or transfers",
            ApiErrorCode::Range => "Out of range",
            ApiErrorCode::Expired => "Resource expired",
            ApiErrorCode::NotFound => "Resource does not exist",
            ApiErrorCode::Circular => "Circular linking detected",
            ApiErrorCode::Access => "Access denied",
            ApiErrorCode::Exists => "Resource already exists",
            ApiErrorCode::Incomplete => "Request incomplete",
            ApiErrorCode::Key => "Cryptographic error",
            ApiErrorCode::Sid => "Invalid or expired session",
            ApiErrorCode::Blocked => "Account blocked",
            ApiErrorCode::OverQuota => "Storage quota exceeded",
            ApiErrorCode::TempUnavail => "Resource temporarily unavailable",
            ApiErrorCode::Unknown => "Unknown error",
        }
    }

    /// Whether a whole-batch retry is appropriate for this code.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiErrorCode::Again | ApiErrorCode::RateLimit | ApiErrorCode::TempUnavail
        )
    }

    /// Map the code to the library error taxonomy.
    pub fn into_error(self) -> MegaError {
        let message = self.description().to_string();
        match self {
            ApiErrorCode::Sid | ApiErrorCode::Blocked => MegaError::Auth(message),
            ApiErrorCode::Again | ApiErrorCode::RateLimit | ApiErrorCode::TempUnavail => {
                MegaError::Transient(message)
            }
            ApiErrorCode::NotFound => MegaError::NotFound(message),
            ApiErrorCode::Access => MegaError::Permission(message),
            ApiErrorCode::OverQuota => MegaError::Quota(message),
            ApiErrorCode::Args | ApiErrorCode::Range => MegaError::Argument(message),
            ApiErrorCode::Key => MegaError::Crypto(message),
            _ => MegaError::Protocol(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_conversion() {
        assert_eq!(ApiErrorCode::from(-3), ApiErrorCode::Again);
        assert_eq!(ApiErrorCode::from(-4), ApiErrorCode::RateLimit);
        assert_eq!(ApiErrorCode::from(-6), ApiErrorCode::TooMany);
        assert_eq!(ApiErrorCode::from(-9), ApiErrorCode::NotFound);
        assert_eq!(ApiErrorCode::from(-11), ApiErrorCode::Access);
        assert_eq!(ApiErrorCode::from(-15), ApiErrorCode::Sid);
        assert_eq!(ApiErrorCode::from(-16), ApiErrorCode::Blocked);
        assert_eq!(ApiErrorCode::from(-17), ApiErrorCode::OverQuota);
        assert_eq!(ApiErrorCode::from(-18), ApiErrorCode::TempUnavail);
        assert_eq!(ApiErrorCode::from(-999), ApiErrorCode::Unknown);
    }

    #[test]
    fn retryable_set() {
        assert!(ApiErrorCode::Again.is_retryable());
        assert!(ApiErrorCode::RateLimit.is_retryable());
        assert!(ApiErrorCode::TempUnavail.is_retryable());
        assert!(!ApiErrorCode::NotFound.is_retryable());
        assert!(!ApiErrorCode::Sid.is_retryable());
    }

    #[test]
    fn taxonomy_mapping() {
        assert!(matches!(
            ApiErrorCode::Sid.into_error(),
            MegaError::Auth(_)
        ));
        assert!(matches!(
            ApiErrorCode::Blocked.into_error(),
            MegaError::Auth(_)
        ));
        assert!(matches!(
            ApiErrorCode::Again.into_error(),
            MegaError::Transient(_)
        ));
        assert!(matches!(
            ApiErrorCode::NotFound.into_error(),
            MegaError::NotFound(_)
        ));
        assert!(matches!(
            ApiErrorCode::Access.into_error(),
            MegaError::Permission(_)
        ));
        assert!(matches!(
            ApiErrorCode::OverQuota.into_error(),
            MegaError::Quota(_)
        ));
    }
}
