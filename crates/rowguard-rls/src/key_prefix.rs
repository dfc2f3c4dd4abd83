//! Tenant-aware cache key mapping.
//!
//! Cache entries written on behalf of a tenant are namespaced as
//! `<base prefix><tenant>:<key>`. Keys containing the global marker, keys
//! written while tenant scoping is suppressed, and keys written without an
//! effective tenant are shared.

use crate::context::RequestContext;
use crate::error::RlsError;
use crate::suppression::Concern;
use crate::tenant::TenantContext;

#[derive(Clone)]
pub struct TenantKeyMapper {
    base_prefix: String,
    global_marker: String,
    tenants: TenantContext,
}

impl TenantKeyMapper {
    pub fn new(
        base_prefix: impl Into<String>,
        global_marker: impl Into<String>,
        tenants: TenantContext,
    ) -> Self {
        Self {
            base_prefix: base_prefix.into(),
            global_marker: global_marker.into(),
            tenants,
        }
    }

    /// The tenant to namespace `key` with, if any.
    fn scoping_tenant(&self, ctx: &RequestContext, key: &str) -> Result<Option<String>, RlsError> {
        if ctx.is_suppressed(Concern::TenantLine) || key.contains(&self.global_marker) {
            return Ok(None);
        }
        let tenant = self.tenants.effective_tenant_id(ctx)?;
        if tenant.is_none() {
            tracing::debug!(key, "no effective tenant; using shared cache key");
        }
        Ok(tenant)
    }

    /// Map a logical key to the stored key.
    pub fn map(&self, ctx: &RequestContext, key: &str) -> Result<Option<String>, RlsError> {
        if key.trim().is_empty() {
            return Ok(None);
        }

        let key = match self.scoping_tenant(ctx, key)? {
            Some(tenant) => {
                let tenant_prefix = format!("{}:", tenant);
                if key.starts_with(&tenant_prefix) {
                    key.to_string()
                } else {
                    format!("{}{}", tenant_prefix, key)
                }
            }
            None => key.to_string(),
        };
        Ok(Some(format!("{}{}", self.base_prefix, key)))
    }

    /// Map a stored key back to the logical key.
    pub fn unmap(&self, ctx: &RequestContext, stored: &str) -> Result<Option<String>, RlsError> {
        let key = stored.strip_prefix(&self.base_prefix).unwrap_or(stored);
        if key.trim().is_empty() {
            return Ok(None);
        }

        let Some(tenant) = self.scoping_tenant(ctx, key)? else {
            return Ok(Some(key.to_string()));
        };
        let tenant_prefix = format!("{}:", tenant);
        Ok(Some(
            key.strip_prefix(&tenant_prefix).unwrap_or(key).to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::InMemoryTenantStore;
    use rowguard_core::{Principal, TenancyConfig};
    use std::sync::Arc;

    fn mapper() -> TenantKeyMapper {
        let tenancy = TenancyConfig {
            enabled: true,
            ..TenancyConfig::default()
        };
        let tenants = TenantContext::new(&tenancy, Arc::new(InMemoryTenantStore::new()));
        TenantKeyMapper::new("app:", tenancy.global_key_marker.clone(), tenants)
    }

    fn ctx() -> RequestContext {
        RequestContext::for_principal(Principal {
            user_id: "1".to_string(),
            tenant_id: Some("000000".to_string()),
            ..Principal::default()
        })
    }

    #[test]
    fn test_map_prefixes_with_tenant() {
        let mapper = mapper();
        let ctx = ctx();
        assert_eq!(
            mapper.map(&ctx, "sys_dict:status").unwrap().as_deref(),
            Some("app:000000:sys_dict:status")
        );
        assert_eq!(
            mapper.unmap(&ctx, "app:000000:sys_dict:status").unwrap().as_deref(),
            Some("sys_dict:status")
        );
    }

    #[test]
    fn test_already_prefixed_key_is_kept() {
        let mapper = mapper();
        assert_eq!(
            mapper.map(&ctx(), "000000:online").unwrap().as_deref(),
            Some("app:000000:online")
        );
    }

    #[test]
    fn test_key_starting_with_tenant_digits_is_still_prefixed() {
        let mapper = mapper();
        let ctx = RequestContext::for_principal(Principal {
            user_id: "1".to_string(),
            tenant_id: Some("1".to_string()),
            ..Principal::default()
        });
        assert_eq!(
            mapper.map(&ctx, "123:session").unwrap().as_deref(),
            Some("app:1:123:session")
        );
        assert_eq!(
            mapper.map(&ctx, "1:session").unwrap().as_deref(),
            Some("app:1:session")
        );
    }

    #[test]
    fn test_global_and_suppressed_keys_are_shared() {
        let mapper = mapper();
        let ctx = ctx();
        assert_eq!(
            mapper.map(&ctx, "global:captcha:42").unwrap().as_deref(),
            Some("app:global:captcha:42")
        );

        ctx.run_suppressed(Concern::TenantLine, || {
            assert_eq!(
                mapper.map(&ctx, "sys_config").unwrap().as_deref(),
                Some("app:sys_config")
            );
        });
    }

    #[test]
    fn test_blank_key() {
        let mapper = mapper();
        assert_eq!(mapper.map(&ctx(), " ").unwrap(), None);
        assert_eq!(mapper.unmap(&ctx(), "app:").unwrap(), None);
    }

    #[test]
    fn test_no_tenant_leaves_key_unscoped() {
        let mapper = mapper();
        let anonymous = RequestContext::anonymous();
        assert_eq!(
            mapper.map(&anonymous, "login:attempts").unwrap().as_deref(),
            Some("app:login:attempts")
        );
    }
}
