//! # error
//!
//! Centralised application error type.
//!
//! Every component returns `Result<_, AppError>`.  Axum's `IntoResponse` impl
//! converts these into structured JSON error bodies so API clients always get
//! a machine-readable response even on failure.

use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::AccountId;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// The exchange rejected the account's API keys.  Never retried.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// No adapter is registered for the requested exchange type.
    #[error("Unsupported exchange: {0}")]
    UnsupportedExchange(String),

    /// Adapter construction or initialisation failed for a non-auth reason.
    #[error("Exchange initialisation failed: {0}")]
    InitError(String),

    /// Any failed exchange call, wrapped with the operation name.
    #[error("{operation} failed: {cause}")]
    OperationFailed {
        operation: &'static str,
        cause: String,
    },

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// The account exists but the component is not tracking it.
    #[error("Account {account_id} is not tracked by the {component}")]
    NotTracked {
        component: &'static str,
        account_id: AccountId,
    },

    #[error("Market {market} is not tracked for account {account_id}")]
    MarketNotTracked { account_id: AccountId, market: String },

    /// Opening the push channel or its default subscriptions failed.
    #[error("Tracking failed for account {account_id}: {cause}")]
    TrackingFailed { account_id: AccountId, cause: String },

    /// Collected per-account failures from one `refresh_all` sweep.
    #[error(transparent)]
    Sweep(#[from] SweepError),

    #[error("Invalid strategy options: {0}")]
    InvalidStrategy(String),

    #[error("Strategy not found: {0}")]
    StrategyNotFound(Uuid),

    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn operation(operation: &'static str, cause: impl fmt::Display) -> Self {
        AppError::OperationFailed {
            operation,
            cause: cause.to_string(),
        }
    }

    pub fn not_tracked(component: &'static str, account_id: AccountId) -> Self {
        AppError::NotTracked {
            component,
            account_id,
        }
    }

    /// Callers should stop retrying on these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::InvalidCredentials(_) | AppError::UnsupportedExchange(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::AccountNotFound(_)
            | AppError::NotTracked { .. }
            | AppError::MarketNotTracked { .. }
            | AppError::StrategyNotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_)
            | AppError::InvalidStrategy(_)
            | AppError::UnsupportedExchange(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials(_) => StatusCode::UNAUTHORIZED,
            AppError::OperationFailed { .. } | AppError::TrackingFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            AppError::InitError(_) | AppError::Sweep(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "ok":    false,
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}

// ─── SweepError ───────────────────────────────────────────────────────────────

/// Per-account failures collected by one `refresh_all` sweep.
#[derive(Debug)]
pub struct SweepError {
    pub domain: &'static str,
    pub failures: Vec<(AccountId, AppError)>,
}

impl SweepError {
    pub fn accounts(&self) -> Vec<AccountId> {
        self.failures.iter().map(|(id, _)| *id).collect()
    }
}

impl fmt::Display for SweepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} refresh failed for {} account(s)",
            self.domain,
            self.failures.len()
        )?;
        for (account_id, err) in &self.failures {
            write!(f, "; {account_id}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SweepError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_failed_message_names_operation() {
        let err = AppError::operation("cancelOrder", "order not found");
        assert_eq!(err.to_string(), "cancelOrder failed: order not found");
    }

    #[test]
    fn test_status_codes() {
        let id = Uuid::new_v4();
        let resp = AppError::not_tracked("order cache", id).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = AppError::operation("openOrder", "boom").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_sweep_error_names_accounts() {
        let id = Uuid::new_v4();
        let err = SweepError {
            domain: "orders",
            failures: vec![(id, AppError::operation("getOpenOrders", "timeout"))],
        };
        let text = err.to_string();
        assert!(text.contains(&id.to_string()));
        assert!(text.contains("getOpenOrders failed: timeout"));
        assert_eq!(err.accounts(), vec![id]);
    }
}
