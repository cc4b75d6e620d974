// crates/memori/src/context.rs
// Per-request tenant context: explicit values plus a thread-local
// "current context" helper for interception callbacks.
//
// Context does NOT propagate implicitly across threads. Work scheduled onto
// the background executor carries its TenantContext in the job itself and
// re-sets it at the start of execution.

use std::cell::RefCell;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{MemoriError, Result};

/// Maximum age of an active context before get() fails closed.
pub const MAX_CONTEXT_AGE: Duration = Duration::from_secs(300);

/// The tenant tuple carried through every storage and search operation.
/// `user_id` is required and non-empty; the rest refine scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub user_id: String,
    pub assistant_id: Option<String>,
    pub session_id: String,
}

impl TenantContext {
    pub fn new(
        user_id: impl Into<String>,
        assistant_id: Option<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            assistant_id,
            session_id: session_id.into(),
        }
    }

    /// Fail closed on a missing user id. Every query layer entry point calls
    /// this before touching the database.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(MemoriError::InvalidTenant(
                "user_id cannot be empty - required for tenant isolation".into(),
            ));
        }
        Ok(())
    }
}

/// Current context for the executing logical request, with lifecycle
/// tracking: creation time, request id, and an active flag.
///
/// State machine: new -> active -> (expired | cleared). Only `active`
/// validates.
#[derive(Debug, Clone)]
pub struct ActiveContext {
    pub tenant: TenantContext,
    pub request_id: String,
    created_at: Instant,
    is_active: bool,
}

impl ActiveContext {
    fn new(tenant: TenantContext, request_id: Option<String>) -> Self {
        Self {
            tenant,
            request_id: request_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            created_at: Instant::now(),
            is_active: true,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Check the context is still usable: active and younger than
    /// [`MAX_CONTEXT_AGE`].
    pub fn validate(&self) -> Result<()> {
        if !self.is_active {
            return Err(MemoriError::NoActiveContext);
        }
        let age = self.age();
        if age > MAX_CONTEXT_AGE {
            return Err(MemoriError::ContextExpired {
                age_secs: age.as_secs(),
                max_secs: MAX_CONTEXT_AGE.as_secs(),
            });
        }
        Ok(())
    }
}

thread_local! {
    static ACTIVE_CONTEXT: RefCell<Option<ActiveContext>> = const { RefCell::new(None) };
}

/// Set the active tenant context for the current thread.
///
/// Always overwrites. Switching between different users logs a warning
/// since it can indicate a context-leak bug in the host.
pub fn set_active_context(tenant: TenantContext, request_id: Option<String>) {
    ACTIVE_CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        if let Some(existing) = slot.as_ref() {
            if existing.is_active && existing.tenant.user_id != tenant.user_id {
                tracing::warn!(
                    previous_user = %existing.tenant.user_id,
                    new_user = %tenant.user_id,
                    previous_request = %existing.request_id,
                    "context switch detected between different users"
                );
            }
        }
        let ctx = ActiveContext::new(tenant, request_id);
        tracing::debug!(
            request_id = %ctx.request_id,
            user_id = %ctx.tenant.user_id,
            session_id = %ctx.tenant.session_id,
            "set active memori context"
        );
        *slot = Some(ctx);
    });
}

/// Get the active tenant context for the current thread.
///
/// With `require_valid`, a missing context raises [`MemoriError::NoActiveContext`]
/// and a stale or deactivated one raises [`MemoriError::ContextExpired`].
/// Without it, invalid contexts degrade to `None` with a warning.
pub fn get_active_context(require_valid: bool) -> Result<Option<TenantContext>> {
    ACTIVE_CONTEXT.with(|cell| {
        let slot = cell.borrow();
        match slot.as_ref() {
            None => {
                if require_valid {
                    Err(MemoriError::NoActiveContext)
                } else {
                    Ok(None)
                }
            }
            Some(ctx) => match ctx.validate() {
                Ok(()) => Ok(Some(ctx.tenant.clone())),
                Err(e) => {
                    if require_valid {
                        Err(e)
                    } else {
                        tracing::warn!(
                            request_id = %ctx.request_id,
                            error = %e,
                            "active context validation failed"
                        );
                        Ok(None)
                    }
                }
            },
        }
    })
}

/// Deactivate and drop the active context for the current thread.
pub fn clear_active_context() {
    ACTIVE_CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        if let Some(ctx) = slot.as_mut() {
            ctx.is_active = false;
            tracing::debug!(
                request_id = %ctx.request_id,
                age_secs = ctx.age().as_secs(),
                "cleared active memori context"
            );
        }
        *slot = None;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(user: &str) -> TenantContext {
        TenantContext::new(user, None, "session-1")
    }

    #[test]
    fn test_validate_rejects_empty_user() {
        let t = TenantContext::new("", None, "s");
        assert!(matches!(t.validate(), Err(MemoriError::InvalidTenant(_))));
        let t = TenantContext::new("   ", None, "s");
        assert!(t.validate().is_err());
        assert!(tenant("alice").validate().is_ok());
    }

    #[test]
    fn test_set_then_get() {
        clear_active_context();
        set_active_context(tenant("alice"), Some("req-1".into()));
        let got = get_active_context(true).unwrap().unwrap();
        assert_eq!(got.user_id, "alice");
        clear_active_context();
    }

    #[test]
    fn test_get_without_context_fails_closed() {
        clear_active_context();
        assert!(matches!(
            get_active_context(true),
            Err(MemoriError::NoActiveContext)
        ));
        assert!(get_active_context(false).unwrap().is_none());
    }

    #[test]
    fn test_clear_deactivates() {
        set_active_context(tenant("alice"), None);
        clear_active_context();
        assert!(get_active_context(true).is_err());
    }

    #[test]
    fn test_overwrite_replaces_context() {
        clear_active_context();
        set_active_context(tenant("alice"), None);
        set_active_context(tenant("bob"), None);
        let got = get_active_context(true).unwrap().unwrap();
        assert_eq!(got.user_id, "bob");
        clear_active_context();
    }

    #[test]
    fn test_context_is_thread_local() {
        clear_active_context();
        set_active_context(tenant("alice"), None);
        let handle = std::thread::spawn(|| get_active_context(false).unwrap().is_none());
        assert!(handle.join().unwrap(), "context must not cross threads");
        clear_active_context();
    }

    #[test]
    fn test_expired_context_fails() {
        let mut ctx = ActiveContext::new(tenant("alice"), None);
        ctx.created_at = Instant::now() - Duration::from_secs(301);
        assert!(matches!(
            ctx.validate(),
            Err(MemoriError::ContextExpired { .. })
        ));
    }
}
