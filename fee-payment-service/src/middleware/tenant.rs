//! Caller identity forwarded by the BFF.
//!
//! The BFF authenticates the user and resolves their tenant before proxying,
//! passing both as headers. Handlers that act on behalf of a payer take a
//! `TenantContext`; operator endpoints only need the tenant.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

pub const TENANT_HEADER: &str = "X-Tenant-ID";
pub const USER_HEADER: &str = "X-User-ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    /// Authenticated user. Absent for service-to-service calls.
    pub user_id: Option<Uuid>,
}

impl TenantContext {
    /// The acting user, required for payer operations.
    pub fn require_user(&self) -> Result<Uuid, AppError> {
        self.user_id.ok_or_else(|| {
            AppError::AuthError(anyhow::anyhow!("Missing {} header (required from BFF)", USER_HEADER))
        })
    }
}

fn header_uuid(parts: &Parts, name: &str) -> Result<Option<Uuid>, AppError> {
    let Some(value) = parts.headers.get(name) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid {} header", name)))?;
    Uuid::parse_str(value)
        .map(Some)
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("{} must be a UUID", name)))
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = header_uuid(parts, TENANT_HEADER)?.ok_or_else(|| {
            AppError::AuthError(anyhow::anyhow!(
                "Missing {} header (required from BFF)",
                TENANT_HEADER
            ))
        })?;
        let user_id = header_uuid(parts, USER_HEADER)?;

        let span = tracing::Span::current();
        span.record("tenant_id", tracing::field::display(tenant_id));
        if let Some(uid) = user_id {
            span.record("user_id", tracing::field::display(uid));
        }

        Ok(TenantContext { tenant_id, user_id })
    }
}
