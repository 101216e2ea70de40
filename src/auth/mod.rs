//! Token authorization.
//!
//! Every RPC operation presents a token; the authorizer maps it to a
//! principal and checks the operation's required permission level against a
//! configurable policy. Nothing here mutates state except a last-seen touch
//! on successful agent auth.

use crate::agent::types::PermissionLevel;
use crate::errors::{HibossError, HibossResult};
use crate::store::Store;
use crate::time::now_ms;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Boss,
    Agent {
        name: String,
        level: PermissionLevel,
    },
}

impl Principal {
    pub fn level(&self) -> PermissionLevel {
        match self {
            Principal::Boss => PermissionLevel::Boss,
            Principal::Agent { level, .. } => *level,
        }
    }

    pub fn is_boss(&self) -> bool {
        matches!(self, Principal::Boss)
    }

    pub fn agent_name(&self) -> Option<&str> {
        match self {
            Principal::Boss => None,
            Principal::Agent { name, .. } => Some(name),
        }
    }
}

/// Built-in operation policy. Operations not listed require boss.
pub fn default_policy() -> HashMap<String, PermissionLevel> {
    let mut policy = HashMap::new();
    let mut set = |op: &str, level: PermissionLevel| {
        policy.insert(op.to_string(), level);
    };

    set("envelope.send", PermissionLevel::Restricted);
    set("envelope.list", PermissionLevel::Restricted);
    set("envelope.get", PermissionLevel::Restricted);
    set("agent.list", PermissionLevel::Restricted);
    set("agent.status", PermissionLevel::Restricted);
    set("reaction.set", PermissionLevel::Restricted);
    set("daemon.time", PermissionLevel::Restricted);

    set("daemon.ping", PermissionLevel::Standard);
    set("cron.create", PermissionLevel::Standard);
    set("cron.list", PermissionLevel::Standard);
    set("cron.get", PermissionLevel::Standard);
    set("cron.enable", PermissionLevel::Standard);
    set("cron.disable", PermissionLevel::Standard);
    set("cron.delete", PermissionLevel::Standard);

    set("agent.bind", PermissionLevel::Privileged);
    set("agent.unbind", PermissionLevel::Privileged);
    set("agent.set", PermissionLevel::Privileged);
    set("agent.session-policy.set", PermissionLevel::Privileged);

    set("daemon.start", PermissionLevel::Boss);
    set("daemon.stop", PermissionLevel::Boss);
    set("daemon.status", PermissionLevel::Boss);
    set("agent.register", PermissionLevel::Boss);
    set("agent.delete", PermissionLevel::Boss);
    set("agent.refresh", PermissionLevel::Boss);
    set("agent.abort", PermissionLevel::Boss);

    policy
}

pub struct Authorizer {
    store: Arc<Store>,
}

impl Authorizer {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Effective policy: stored `permission_policy` overrides layered on the
    /// defaults. A malformed stored policy falls back to the defaults.
    fn policy(&self) -> HashMap<String, PermissionLevel> {
        let mut policy = default_policy();
        if let Ok(Some(raw)) = self.store.get_config("permission_policy") {
            match serde_json::from_str::<HashMap<String, PermissionLevel>>(&raw) {
                Ok(overrides) => policy.extend(overrides),
                Err(e) => warn!("ignoring malformed permission_policy config: {}", e),
            }
        }
        policy
    }

    /// Required level for an operation. Unknown operations require boss.
    pub fn required_level(&self, operation: &str) -> PermissionLevel {
        self.policy()
            .get(operation)
            .copied()
            .unwrap_or(PermissionLevel::Boss)
    }

    /// Resolve a token to a principal without a permission check.
    pub fn identify(&self, token: &str) -> HibossResult<Principal> {
        if self.store.verify_boss_token(token)? {
            return Ok(Principal::Boss);
        }
        match self.store.get_agent_by_token(token)? {
            Some(agent) => {
                self.store.touch_agent_last_seen(&agent.name, now_ms())?;
                Ok(Principal::Agent {
                    name: agent.name,
                    level: agent.permission_level,
                })
            }
            None => Err(HibossError::invalid_token()),
        }
    }

    /// Full authorization: setup gate, token resolution, permission check.
    pub fn authorize(&self, operation: &str, token: &str) -> HibossResult<Principal> {
        if !self.store.setup_completed()? && !operation.starts_with("setup.") {
            return Err(HibossError::SetupRequired);
        }
        let principal = self.identify(token)?;
        if principal.level() >= self.required_level(operation) {
            Ok(principal)
        } else {
            Err(HibossError::access_denied(operation))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::Agent;
    use crate::providers::ProviderKind;
    use crate::store::hash_boss_token;
    use std::path::PathBuf;

    fn setup() -> (Arc<Store>, Authorizer) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.set_config("setup_completed", "true").unwrap();
        store
            .set_config("boss_token_hash", &hash_boss_token("boss-secret"))
            .unwrap();
        store
            .create_agent(&Agent {
                name: "nex".into(),
                token: "agent-secret".into(),
                description: None,
                workspace: PathBuf::from("/tmp/nex"),
                provider: ProviderKind::Claude,
                model: None,
                reasoning_effort: None,
                permission_level: PermissionLevel::Restricted,
                session_policy: None,
                metadata: None,
                created_at: 0,
                last_seen_at: None,
            })
            .unwrap();
        let auth = Authorizer::new(store.clone());
        (store, auth)
    }

    #[test]
    fn setup_gate_blocks_everything_but_setup_ops() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let auth = Authorizer::new(store);
        assert!(matches!(
            auth.authorize("envelope.send", "whatever"),
            Err(HibossError::SetupRequired)
        ));
    }

    #[test]
    fn boss_token_grants_boss_level() {
        let (_store, auth) = setup();
        let principal = auth.authorize("agent.register", "boss-secret").unwrap();
        assert!(principal.is_boss());
        assert_eq!(principal.level(), PermissionLevel::Boss);
    }

    #[test]
    fn agent_token_resolves_with_level() {
        let (store, auth) = setup();
        let principal = auth.authorize("envelope.send", "agent-secret").unwrap();
        assert_eq!(principal.agent_name(), Some("nex"));
        assert_eq!(principal.level(), PermissionLevel::Restricted);
        assert!(
            store
                .get_agent("nex")
                .unwrap()
                .unwrap()
                .last_seen_at
                .is_some()
        );
    }

    #[test]
    fn unknown_token_rejected() {
        let (_store, auth) = setup();
        let err = auth.authorize("envelope.send", "nope").unwrap_err();
        assert!(matches!(err, HibossError::Unauthorized(_)));
        assert_eq!(err.to_string(), "Invalid token");
    }

    #[test]
    fn insufficient_level_denied() {
        let (_store, auth) = setup();
        // Restricted agent, privileged operation
        let err = auth.authorize("agent.bind", "agent-secret").unwrap_err();
        assert!(err.to_string().contains("Access denied"));
        // Unknown operation defaults to boss
        assert!(auth.authorize("daemon.selfdestruct", "agent-secret").is_err());
        assert!(auth.authorize("daemon.selfdestruct", "boss-secret").is_ok());
    }

    #[test]
    fn policy_overrides_apply() {
        let (store, auth) = setup();
        store
            .set_config("permission_policy", r#"{"agent.bind": "restricted"}"#)
            .unwrap();
        assert!(auth.authorize("agent.bind", "agent-secret").is_ok());
        // Untouched entries keep their defaults
        assert_eq!(
            auth.required_level("agent.register"),
            PermissionLevel::Boss
        );
    }
}
