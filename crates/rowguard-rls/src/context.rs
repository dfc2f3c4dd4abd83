//! Per-unit-of-work request context.
//!
//! A [`RequestContext`] carries the caller's session, the suppression scopes
//! and the context-local dynamic tenant. It is passed explicitly to every
//! scoping call. The type is `Send` but not `Sync`: work handed to another
//! thread needs its own context, created with [`RequestContext::fork`].

use std::cell::RefCell;
use std::sync::Arc;

use rowguard_core::{Principal, RoleScope};

use crate::suppression::{Concern, SuppressionScope};

/// Identity of the caller, as supplied by the authentication layer.
pub trait Session: Send + Sync {
    fn is_authenticated(&self) -> bool;

    fn user_id(&self) -> Option<&str>;

    /// Tenant the caller authenticated against.
    fn tenant_id(&self) -> Option<&str>;

    fn dept_id(&self) -> Option<&str> {
        None
    }

    fn roles(&self) -> &[RoleScope] {
        &[]
    }

    fn is_super_admin(&self) -> bool {
        false
    }
}

impl Session for Principal {
    fn is_authenticated(&self) -> bool {
        true
    }

    fn user_id(&self) -> Option<&str> {
        Some(&self.user_id)
    }

    fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    fn dept_id(&self) -> Option<&str> {
        self.dept_id.as_deref()
    }

    fn roles(&self) -> &[RoleScope] {
        &self.roles
    }

    fn is_super_admin(&self) -> bool {
        self.super_admin
    }
}

/// An unauthenticated caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl Session for Anonymous {
    fn is_authenticated(&self) -> bool {
        false
    }

    fn user_id(&self) -> Option<&str> {
        None
    }

    fn tenant_id(&self) -> Option<&str> {
        None
    }
}

/// State of one logical unit of work (a request, a job, ...).
pub struct RequestContext {
    session: Arc<dyn Session>,
    suppression: RefCell<SuppressionScope>,
    dynamic_tenant: RefCell<Option<String>>,
}

impl RequestContext {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self {
            session,
            suppression: RefCell::new(SuppressionScope::new()),
            dynamic_tenant: RefCell::new(None),
        }
    }

    /// Context for an authenticated principal.
    pub fn for_principal(principal: Principal) -> Self {
        Self::new(Arc::new(principal))
    }

    /// Context for an unauthenticated caller.
    pub fn anonymous() -> Self {
        Self::new(Arc::new(Anonymous))
    }

    pub fn session(&self) -> &dyn Session {
        self.session.as_ref()
    }

    /// Create a context for work dispatched to another thread.
    ///
    /// The new context shares the session and starts with the current
    /// context-local dynamic tenant; suppression scopes are not carried over.
    pub fn fork(&self) -> RequestContext {
        RequestContext {
            session: Arc::clone(&self.session),
            suppression: RefCell::new(SuppressionScope::new()),
            dynamic_tenant: RefCell::new(self.local_dynamic_tenant()),
        }
    }

    // ------------------------------------------------------------------
    // Suppression
    // ------------------------------------------------------------------

    /// Start suppressing `concern` until [`disable`](Self::disable).
    pub fn enable(&self, concern: Concern) {
        self.suppression.borrow_mut().enable(concern);
    }

    /// Stop one level of suppression of `concern`.
    pub fn disable(&self, concern: Concern) {
        self.suppression.borrow_mut().disable(concern);
    }

    pub fn is_suppressed(&self, concern: Concern) -> bool {
        self.suppression.borrow().is_suppressed(concern)
    }

    pub fn suppression_depth(&self, concern: Concern) -> u32 {
        self.suppression.borrow().depth(concern)
    }

    /// Snapshot of the suppression state.
    pub fn suppression(&self) -> SuppressionScope {
        self.suppression.borrow().clone()
    }

    /// Suppress `concern` until the returned guard is dropped.
    pub fn suppress(&self, concern: Concern) -> SuppressionGuard<'_> {
        self.enable(concern);
        SuppressionGuard { ctx: self, concern }
    }

    /// Run `f` with `concern` suppressed. Suppression ends when `f` returns,
    /// including when it returns an error or panics.
    pub fn run_suppressed<R>(&self, concern: Concern, f: impl FnOnce() -> R) -> R {
        let _guard = self.suppress(concern);
        f()
    }

    /// Reset suppression state at the end of the unit of work.
    pub fn clear_suppression(&self) {
        self.suppression.borrow_mut().clear();
    }

    // ------------------------------------------------------------------
    // Context-local dynamic tenant (see `TenantContext` for the full rules)
    // ------------------------------------------------------------------

    pub(crate) fn local_dynamic_tenant(&self) -> Option<String> {
        self.dynamic_tenant.borrow().clone()
    }

    pub(crate) fn replace_local_dynamic_tenant(&self, tenant_id: Option<String>) -> Option<String> {
        self.dynamic_tenant.replace(tenant_id)
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("authenticated", &self.session.is_authenticated())
            .field("user_id", &self.session.user_id())
            .field("suppression", &self.suppression.borrow())
            .field("dynamic_tenant", &self.dynamic_tenant.borrow())
            .finish()
    }
}

/// Ends one level of suppression when dropped.
#[must_use = "suppression ends as soon as the guard is dropped"]
pub struct SuppressionGuard<'a> {
    ctx: &'a RequestContext,
    concern: Concern,
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        self.ctx.disable(self.concern);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn test_run_suppressed_restores_on_error() {
        let ctx = RequestContext::anonymous();
        let result: Result<(), &str> = ctx.run_suppressed(Concern::TenantLine, || {
            assert!(ctx.is_suppressed(Concern::TenantLine));
            Err("boom")
        });
        assert!(result.is_err());
        assert_eq!(ctx.suppression_depth(Concern::TenantLine), 0);
        assert!(!ctx.is_suppressed(Concern::TenantLine));
    }

    #[test]
    fn test_run_suppressed_restores_on_panic() {
        let ctx = RequestContext::anonymous();
        ctx.enable(Concern::DataPermission);

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            ctx.run_suppressed::<()>(Concern::DataPermission, || panic!("mapper failed"))
        }));
        assert!(outcome.is_err());

        // Back to the pre-call depth, not to zero.
        assert_eq!(ctx.suppression_depth(Concern::DataPermission), 1);
        assert!(ctx.is_suppressed(Concern::DataPermission));
    }

    #[test]
    fn test_nested_guards_across_concerns() {
        let ctx = RequestContext::anonymous();
        {
            let _tenant = ctx.suppress(Concern::TenantLine);
            ctx.run_suppressed(Concern::DataPermission, || {
                let _again = ctx.suppress(Concern::TenantLine);
                assert_eq!(ctx.suppression_depth(Concern::TenantLine), 2);
                assert!(ctx.is_suppressed(Concern::DataPermission));
            });
            assert!(ctx.is_suppressed(Concern::TenantLine));
            assert!(!ctx.is_suppressed(Concern::DataPermission));
        }
        assert!(ctx.suppression().is_idle());
    }

    #[test]
    fn test_fork_carries_session_and_tenant_but_not_suppression() {
        let ctx = RequestContext::for_principal(Principal {
            user_id: "1".to_string(),
            tenant_id: Some("000000".to_string()),
            ..Principal::default()
        });
        ctx.replace_local_dynamic_tenant(Some("100001".to_string()));
        let _guard = ctx.suppress(Concern::TenantLine);

        let forked = ctx.fork();
        assert_eq!(forked.session().user_id(), Some("1"));
        assert_eq!(forked.local_dynamic_tenant().as_deref(), Some("100001"));
        assert!(!forked.is_suppressed(Concern::TenantLine));
    }
}
