//! Effective tenant resolution and dynamic tenant overrides.
//!
//! Precedence, highest first:
//! 1. the context-local dynamic tenant;
//! 2. the global dynamic tenant stored for the authenticated user;
//! 3. the tenant of the authenticated session.
//!
//! Everything here is a no-op when tenancy is disabled.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rowguard_core::TenancyConfig;

use crate::context::RequestContext;
use crate::error::RlsError;

/// Key (under the global marker) that holds per-user dynamic tenants.
const DYNAMIC_TENANT_KEY: &str = "dynamic_tenant";

/// Shared key/value store visible to all of a user's requests.
pub trait TenantStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;

    fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Process-local [`TenantStore`].
#[derive(Debug, Default)]
pub struct InMemoryTenantStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TenantStore for InMemoryTenantStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("tenant store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("tenant store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("tenant store lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

/// Resolves the tenant that statements of a context are scoped to.
#[derive(Clone)]
pub struct TenantContext {
    enabled: bool,
    global_key_marker: String,
    store: Arc<dyn TenantStore>,
}

impl TenantContext {
    pub fn new(config: &TenancyConfig, store: Arc<dyn TenantStore>) -> Self {
        Self {
            enabled: config.enabled,
            global_key_marker: config.global_key_marker.clone(),
            store,
        }
    }

    /// Whether multi-tenancy is switched on.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn global_key(&self, user_id: &str) -> String {
        format!("{}{}:{}", self.global_key_marker, DYNAMIC_TENANT_KEY, user_id)
    }

    /// Store key for the current user's global override, if authenticated.
    fn user_key(&self, ctx: &RequestContext) -> Option<String> {
        let session = ctx.session();
        if !session.is_authenticated() {
            return None;
        }
        session.user_id().map(|user_id| self.global_key(user_id))
    }

    /// Set a dynamic tenant.
    ///
    /// With `global` and an authenticated caller the override is stored per
    /// user and stays visible to later contexts of the same user until
    /// cleared. Otherwise it only lives in `ctx`.
    pub fn set_dynamic(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        global: bool,
    ) -> Result<(), RlsError> {
        if !self.enabled {
            return Ok(());
        }

        if global {
            if let Some(key) = self.user_key(ctx) {
                self.store.set(&key, tenant_id)?;
                return Ok(());
            }
            tracing::debug!(
                tenant_id,
                "global dynamic tenant needs an authenticated user; keeping it context-local"
            );
        }

        ctx.replace_local_dynamic_tenant(Some(tenant_id.to_string()));
        Ok(())
    }

    /// The dynamic tenant currently in force, if any.
    pub fn get_dynamic(&self, ctx: &RequestContext) -> Result<Option<String>, RlsError> {
        if !self.enabled {
            return Ok(None);
        }

        if let Some(tenant_id) = non_blank(ctx.local_dynamic_tenant()) {
            return Ok(Some(tenant_id));
        }

        match self.user_key(ctx) {
            Some(key) => Ok(non_blank(self.store.get(&key)?)),
            None => Ok(None),
        }
    }

    /// Remove the context-local override and the caller's global override.
    pub fn clear_dynamic(&self, ctx: &RequestContext) -> Result<(), RlsError> {
        if !self.enabled {
            return Ok(());
        }

        if ctx.replace_local_dynamic_tenant(None).is_none() && !ctx.session().is_authenticated() {
            tracing::warn!("clear_dynamic called with no dynamic tenant set");
        }

        if let Some(key) = self.user_key(ctx) {
            self.store.delete(&key)?;
        }
        Ok(())
    }

    /// The tenant statements of `ctx` are scoped to.
    pub fn effective_tenant_id(&self, ctx: &RequestContext) -> Result<Option<String>, RlsError> {
        if !self.enabled {
            return Ok(None);
        }

        if let Some(tenant_id) = self.get_dynamic(ctx)? {
            return Ok(Some(tenant_id));
        }

        Ok(non_blank(ctx.session().tenant_id().map(str::to_string)))
    }

    /// Run `f` with `tenant_id` as the context-local dynamic tenant.
    ///
    /// The previous context-local value is restored when `f` finishes,
    /// whether it returns normally, returns an error or panics.
    pub fn run_with_tenant<R>(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        f: impl FnOnce() -> R,
    ) -> R {
        if !self.enabled {
            return f();
        }

        let previous = ctx.replace_local_dynamic_tenant(Some(tenant_id.to_string()));
        let _restore = DynamicTenantGuard { ctx, previous };
        f()
    }
}

/// Restores the previous context-local dynamic tenant on drop.
struct DynamicTenantGuard<'a> {
    ctx: &'a RequestContext,
    previous: Option<String>,
}

impl Drop for DynamicTenantGuard<'_> {
    fn drop(&mut self) {
        self.ctx.replace_local_dynamic_tenant(self.previous.take());
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowguard_core::Principal;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn tenancy(enabled: bool) -> TenancyConfig {
        TenancyConfig {
            enabled,
            ..TenancyConfig::default()
        }
    }

    fn principal(user_id: &str, tenant_id: &str) -> Principal {
        Principal {
            user_id: user_id.to_string(),
            tenant_id: Some(tenant_id.to_string()),
            ..Principal::default()
        }
    }

    fn tenants(enabled: bool) -> (TenantContext, Arc<InMemoryTenantStore>) {
        let store = Arc::new(InMemoryTenantStore::new());
        (TenantContext::new(&tenancy(enabled), store.clone()), store)
    }

    #[test]
    fn test_dynamic_tenant_takes_precedence() {
        let (tenants, _) = tenants(true);
        let ctx = RequestContext::for_principal(principal("1", "A"));

        assert_eq!(tenants.effective_tenant_id(&ctx).unwrap().as_deref(), Some("A"));

        tenants.set_dynamic(&ctx, "B", false).unwrap();
        assert_eq!(tenants.effective_tenant_id(&ctx).unwrap().as_deref(), Some("B"));

        tenants.clear_dynamic(&ctx).unwrap();
        assert_eq!(tenants.effective_tenant_id(&ctx).unwrap().as_deref(), Some("A"));
    }

    #[test]
    fn test_disabled_tenancy_is_inert() {
        let (tenants, _) = tenants(false);
        let ctx = RequestContext::for_principal(principal("1", "A"));

        tenants.set_dynamic(&ctx, "B", false).unwrap();
        assert_eq!(tenants.get_dynamic(&ctx).unwrap(), None);
        assert_eq!(tenants.effective_tenant_id(&ctx).unwrap(), None);
        assert_eq!(tenants.run_with_tenant(&ctx, "C", || 7), 7);
    }

    #[test]
    fn test_global_override_is_visible_to_later_contexts_of_same_user() {
        let (tenants, store) = tenants(true);
        let first = RequestContext::for_principal(principal("1", "A"));
        tenants.set_dynamic(&first, "B", true).unwrap();
        assert_eq!(
            store.get("global:dynamic_tenant:1").unwrap().as_deref(),
            Some("B")
        );

        let second = RequestContext::for_principal(principal("1", "A"));
        assert_eq!(tenants.effective_tenant_id(&second).unwrap().as_deref(), Some("B"));

        let other_user = RequestContext::for_principal(principal("2", "A"));
        assert_eq!(tenants.effective_tenant_id(&other_user).unwrap().as_deref(), Some("A"));

        tenants.clear_dynamic(&second).unwrap();
        assert_eq!(tenants.effective_tenant_id(&first).unwrap().as_deref(), Some("A"));
    }

    #[test]
    fn test_local_override_beats_global_override() {
        let (tenants, _) = tenants(true);
        let ctx = RequestContext::for_principal(principal("1", "A"));
        tenants.set_dynamic(&ctx, "G", true).unwrap();
        tenants.set_dynamic(&ctx, "L", false).unwrap();
        assert_eq!(tenants.get_dynamic(&ctx).unwrap().as_deref(), Some("L"));
    }

    #[test]
    fn test_global_override_without_login_stays_local() {
        let (tenants, store) = tenants(true);
        let ctx = RequestContext::anonymous();
        tenants.set_dynamic(&ctx, "B", true).unwrap();

        assert_eq!(tenants.effective_tenant_id(&ctx).unwrap().as_deref(), Some("B"));
        assert!(store.entries.read().unwrap().is_empty());

        let other = RequestContext::anonymous();
        assert_eq!(tenants.effective_tenant_id(&other).unwrap(), None);
    }

    #[test]
    fn test_run_with_tenant_nests_and_restores() {
        let (tenants, _) = tenants(true);
        let ctx = RequestContext::for_principal(principal("1", "A"));

        tenants.run_with_tenant(&ctx, "B", || {
            assert_eq!(tenants.effective_tenant_id(&ctx).unwrap().as_deref(), Some("B"));
            tenants.run_with_tenant(&ctx, "C", || {
                assert_eq!(tenants.effective_tenant_id(&ctx).unwrap().as_deref(), Some("C"));
            });
            assert_eq!(tenants.effective_tenant_id(&ctx).unwrap().as_deref(), Some("B"));
        });
        assert_eq!(tenants.effective_tenant_id(&ctx).unwrap().as_deref(), Some("A"));
    }

    #[test]
    fn test_run_with_tenant_restores_after_panic() {
        let (tenants, _) = tenants(true);
        let ctx = RequestContext::for_principal(principal("1", "A"));

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            tenants.run_with_tenant::<()>(&ctx, "B", || panic!("service failed"))
        }));
        assert!(outcome.is_err());
        assert_eq!(tenants.effective_tenant_id(&ctx).unwrap().as_deref(), Some("A"));
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let (tenants, _) = tenants(true);
        let ctx = RequestContext::for_principal(principal("1", "A"));
        tenants.set_dynamic(&ctx, "  ", false).unwrap();
        assert_eq!(tenants.effective_tenant_id(&ctx).unwrap().as_deref(), Some("A"));
    }
}
