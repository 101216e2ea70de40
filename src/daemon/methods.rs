//! RPC method dispatch.
//!
//! One match over the method set; every authenticated method pulls `token`
//! from params and goes through the authorizer before touching anything.

use crate::agent::AgentExecutor;
use crate::agent::types::{PermissionLevel, SessionPolicy};
use crate::auth::{Authorizer, Principal};
use crate::channels::registry::AdapterRegistry;
use crate::config::{DataPaths, keys};
use crate::cron::CronScheduler;
use crate::cron::types::NewCronSchedule;
use crate::envelope::{Address, Attachment, EnvelopeContent, EnvelopeMetadata, EnvelopeStatus, NewEnvelope, validate_agent_name};
use crate::errors::{HibossError, HibossResult};
use crate::ids::{IdLookup, new_id, short_id};
use crate::providers::{ProviderKind, ReasoningEffort};
use crate::router::Router;
use crate::rpc::{RpcError, RpcHandler};
use crate::scheduler::EnvelopeScheduler;
use crate::store::{EnvelopeFilter, IdTable, Store, hash_boss_token};
use crate::time::{format_in_tz, now_ms, parse_deliver_at};
use crate::{VERSION, config};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::info;

pub struct Methods {
    pub store: Arc<Store>,
    pub auth: Arc<Authorizer>,
    pub router: Arc<Router>,
    pub cron: Arc<CronScheduler>,
    pub executor: Arc<AgentExecutor>,
    pub adapters: Arc<AdapterRegistry>,
    pub scheduler: Arc<EnvelopeScheduler>,
    pub paths: DataPaths,
    pub started_at: Instant,
    pub shutdown: watch::Sender<bool>,
}

fn parse<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, RpcError> {
    serde_json::from_value(params.clone()).map_err(RpcError::invalid_params)
}

fn token_of(params: &Value) -> Result<String, RpcError> {
    params
        .get("token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RpcError::invalid_params("missing token"))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value)
        .map_err(|e| RpcError::from(HibossError::Internal(anyhow::anyhow!(e))))
}

impl Methods {
    fn resolve_prefix(&self, table: IdTable, id: &str) -> HibossResult<String> {
        match self.store.find_id_by_prefix(table, id)? {
            IdLookup::Unique(full) => Ok(full),
            IdLookup::None => Err(HibossError::NotFound {
                entity: table.entity(),
                id: id.to_string(),
            }),
            IdLookup::Ambiguous(candidates) => Err(HibossError::AmbiguousIdPrefix {
                entity: table.entity(),
                prefix: id.to_string(),
                candidates,
            }),
        }
    }

    fn require_agent(&self, name: &str) -> HibossResult<crate::agent::types::Agent> {
        self.store
            .get_agent(name)?
            .ok_or_else(|| HibossError::NotFound {
                entity: "agent",
                id: name.to_string(),
            })
    }

    fn envelope_json(&self, env: &crate::envelope::Envelope) -> Result<Value, RpcError> {
        let mut value = to_value(env)?;
        value["shortId"] = json!(short_id(&env.id));
        Ok(value)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendParams {
    to: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default)]
    deliver_at: Option<String>,
    #[serde(default)]
    parse_mode: Option<String>,
    #[serde(default)]
    reply_to_envelope_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterParams {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    workspace: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    reasoning_effort: Option<String>,
    #[serde(default)]
    permission_level: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetParams {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<Value>,
    #[serde(default)]
    reasoning_effort: Option<Value>,
    #[serde(default)]
    permission_level: Option<String>,
    #[serde(default)]
    workspace: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshParams {
    name: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyParams {
    name: String,
    #[serde(default)]
    policy: Option<SessionPolicy>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindParams {
    name: String,
    adapter_type: String,
    adapter_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnbindParams {
    name: String,
    adapter_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReactionParams {
    #[serde(default)]
    agent_name: Option<String>,
    adapter_type: String,
    chat_id: String,
    channel_message_id: String,
    emoji: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetupParams {
    boss_name: String,
    boss_token: String,
    #[serde(default)]
    boss_timezone: Option<String>,
    #[serde(default)]
    default_provider: Option<String>,
    #[serde(default)]
    adapter_boss_ids: std::collections::HashMap<String, String>,
}

#[async_trait::async_trait]
impl RpcHandler for Methods {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            // ---- unauthenticated surface ----
            "setup.check" => Ok(json!({
                "setupCompleted": self.store.setup_completed().map_err(RpcError::from)?,
            })),
            "setup.execute" => self.setup_execute(&params).await,
            "boss.verify" => {
                let token = token_of(&params)?;
                let valid = self.store.verify_boss_token(&token).map_err(RpcError::from)?;
                Ok(json!({"valid": valid}))
            }

            // ---- daemon ----
            "daemon.ping" => {
                self.authorize(method, &params)?;
                Ok(json!({"pong": true, "at": now_ms()}))
            }
            "daemon.status" => {
                self.authorize(method, &params)?;
                self.daemon_status()
            }
            "daemon.stop" => {
                self.authorize(method, &params)?;
                info!("daemon.stop requested over rpc");
                let _ = self.shutdown.send(true);
                Ok(json!({"stopping": true}))
            }
            "daemon.time" => {
                self.authorize(method, &params)?;
                let tz = config::boss_timezone(&self.store);
                let now = now_ms();
                Ok(json!({
                    "utcMs": now,
                    "timezone": tz.name(),
                    "local": format_in_tz(now, &tz),
                }))
            }

            // ---- envelopes ----
            "envelope.send" => self.envelope_send(&params).await,
            "envelope.list" => {
                self.authorize(method, &params)?;
                let p: ListParams = parse(&params)?;
                let status = match p.status.as_deref() {
                    Some(raw) => Some(EnvelopeStatus::parse(raw).map_err(RpcError::from)?),
                    None => None,
                };
                let envelopes = self
                    .store
                    .list_envelopes(&EnvelopeFilter {
                        status,
                        to: p.to,
                        from: p.from,
                        limit: p.limit,
                    })
                    .map_err(RpcError::from)?;
                let rendered: Result<Vec<Value>, RpcError> =
                    envelopes.iter().map(|e| self.envelope_json(e)).collect();
                Ok(Value::Array(rendered?))
            }
            "envelope.get" => {
                self.authorize(method, &params)?;
                let p: IdParams = parse(&params)?;
                let full = self
                    .resolve_prefix(IdTable::Envelopes, &p.id)
                    .map_err(RpcError::from)?;
                let env = self
                    .store
                    .get_envelope(&full)
                    .map_err(RpcError::from)?
                    .ok_or_else(|| {
                        RpcError::from(HibossError::NotFound {
                            entity: "envelope",
                            id: p.id.clone(),
                        })
                    })?;
                self.envelope_json(&env)
            }

            // ---- agents ----
            "agent.register" => self.agent_register(&params).await,
            "agent.list" => {
                self.authorize(method, &params)?;
                let agents = self.store.list_agents().map_err(RpcError::from)?;
                to_value(&agents)
            }
            "agent.status" => {
                self.authorize(method, &params)?;
                let p: NameParams = parse(&params)?;
                self.agent_status(&p.name).await
            }
            "agent.set" => self.agent_set(&params).await,
            "agent.delete" => {
                self.authorize(method, &params)?;
                let p: NameParams = parse(&params)?;
                self.require_agent(&p.name).map_err(RpcError::from)?;
                self.executor.forget_agent(&p.name).await;
                self.store.delete_agent(&p.name).map_err(RpcError::from)?;
                info!("agent {} deleted", p.name);
                Ok(json!({"deleted": true}))
            }
            "agent.refresh" => {
                self.authorize(method, &params)?;
                let p: RefreshParams = parse(&params)?;
                self.require_agent(&p.name).map_err(RpcError::from)?;
                self.executor
                    .request_refresh(&p.name, p.reason.as_deref().unwrap_or("agent.refresh"))
                    .await;
                Ok(json!({"queued": true}))
            }
            "agent.abort" => {
                self.authorize(method, &params)?;
                let p: NameParams = parse(&params)?;
                self.require_agent(&p.name).map_err(RpcError::from)?;
                let aborted = self.executor.abort(&p.name).await.map_err(RpcError::from)?;
                Ok(json!({"aborted": aborted}))
            }
            "agent.session-policy.set" => {
                self.authorize(method, &params)?;
                let p: PolicyParams = parse(&params)?;
                let mut agent = self.require_agent(&p.name).map_err(RpcError::from)?;
                if let Some(policy) = &p.policy {
                    policy.validate().map_err(RpcError::from)?;
                }
                agent.session_policy = p.policy;
                self.store.update_agent(&agent).map_err(RpcError::from)?;
                Ok(json!({"updated": true}))
            }
            "agent.bind" => {
                self.authorize(method, &params)?;
                let p: BindParams = parse(&params)?;
                self.require_agent(&p.name).map_err(RpcError::from)?;
                self.store
                    .upsert_binding(&crate::agent::types::AgentBinding {
                        agent_name: p.name.clone(),
                        adapter_type: p.adapter_type.clone(),
                        adapter_token: p.adapter_token,
                        created_at: now_ms(),
                    })
                    .map_err(RpcError::from)?;
                info!("agent {} bound to {}", p.name, p.adapter_type);
                Ok(json!({"bound": true}))
            }
            "agent.unbind" => {
                self.authorize(method, &params)?;
                let p: UnbindParams = parse(&params)?;
                let removed = self
                    .store
                    .delete_binding(&p.name, &p.adapter_type)
                    .map_err(RpcError::from)?;
                if !removed {
                    return Err(RpcError::from(HibossError::NotFound {
                        entity: "binding",
                        id: format!("{}/{}", p.name, p.adapter_type),
                    }));
                }
                Ok(json!({"unbound": true}))
            }

            // ---- cron ----
            "cron.create" => {
                self.authorize(method, &params)?;
                let input: NewCronSchedule = parse(&params)?;
                let sched = self.cron.create_schedule(input).await.map_err(RpcError::from)?;
                let mut value = to_value(&sched)?;
                value["shortId"] = json!(short_id(&sched.id));
                Ok(value)
            }
            "cron.list" => {
                self.authorize(method, &params)?;
                let scheds = self.cron.list_schedules().await.map_err(RpcError::from)?;
                to_value(&scheds)
            }
            "cron.get" => {
                self.authorize(method, &params)?;
                let p: IdParams = parse(&params)?;
                let full = self
                    .resolve_prefix(IdTable::CronSchedules, &p.id)
                    .map_err(RpcError::from)?;
                let sched = self.cron.get_schedule(&full).await.map_err(RpcError::from)?;
                to_value(&sched)
            }
            "cron.enable" | "cron.disable" | "cron.delete" => {
                self.authorize(method, &params)?;
                let p: IdParams = parse(&params)?;
                let full = self
                    .resolve_prefix(IdTable::CronSchedules, &p.id)
                    .map_err(RpcError::from)?;
                match method {
                    "cron.enable" => {
                        let sched = self.cron.enable_schedule(&full).await.map_err(RpcError::from)?;
                        to_value(&sched)
                    }
                    "cron.disable" => {
                        let sched = self
                            .cron
                            .disable_schedule(&full)
                            .await
                            .map_err(RpcError::from)?;
                        to_value(&sched)
                    }
                    _ => {
                        self.cron.delete_schedule(&full).await.map_err(RpcError::from)?;
                        Ok(json!({"deleted": true}))
                    }
                }
            }

            // ---- reactions ----
            "reaction.set" => self.reaction_set(&params).await,

            other => Err(RpcError::method_not_found(other)),
        }
    }
}

impl Methods {
    fn authorize(&self, operation: &str, params: &Value) -> Result<Principal, RpcError> {
        let token = token_of(params)?;
        self.auth.authorize(operation, &token).map_err(RpcError::from)
    }

    fn daemon_status(&self) -> Result<Value, RpcError> {
        Ok(json!({
            "version": VERSION,
            "uptimeSeconds": self.started_at.elapsed().as_secs(),
            "pendingEnvelopes": self.store.count_pending_envelopes().map_err(RpcError::from)?,
            "agentCount": self.store.list_agents().map_err(RpcError::from)?.len(),
            "adaptersLoaded": self.adapters.len(),
            "nextWakeAt": self.scheduler.next_wake_at(),
        }))
    }

    async fn envelope_send(&self, params: &Value) -> Result<Value, RpcError> {
        let principal = self.authorize("envelope.send", params)?;
        let p: SendParams = parse(params)?;

        let to = Address::parse(&p.to).map_err(RpcError::from)?;
        let own_address = principal
            .agent_name()
            .map(Address::agent)
            .unwrap_or_else(|| Address::agent("boss"));
        let from = match &p.from {
            Some(raw) => {
                let requested = Address::parse(raw).map_err(RpcError::from)?;
                if !principal.is_boss() && requested != own_address {
                    return Err(RpcError::from(HibossError::validation(
                        "Agents can only send as themselves",
                    )));
                }
                requested
            }
            None => own_address,
        };

        let deliver_at = match &p.deliver_at {
            Some(raw) => Some(parse_deliver_at(raw, now_ms()).map_err(RpcError::from)?),
            None => None,
        };
        let reply_to_envelope_id = match &p.reply_to_envelope_id {
            Some(raw) => Some(
                self.resolve_prefix(IdTable::Envelopes, raw)
                    .map_err(RpcError::from)?,
            ),
            None => None,
        };

        let content = EnvelopeContent {
            text: p.text,
            attachments: p.attachments,
        };
        if content.is_empty() {
            return Err(RpcError::invalid_params("empty envelope content"));
        }

        let input = NewEnvelope {
            from,
            to,
            from_boss: principal.is_boss(),
            content,
            deliver_at,
            metadata: EnvelopeMetadata {
                parse_mode: p.parse_mode,
                reply_to_envelope_id,
                ..Default::default()
            },
        };
        let (env, deliver_error) = self.router.route_envelope(input).await.map_err(RpcError::from)?;
        if let Some(err) = deliver_error {
            return Err(RpcError::from(err));
        }
        self.envelope_json(&env)
    }

    async fn agent_register(&self, params: &Value) -> Result<Value, RpcError> {
        self.authorize("agent.register", params)?;
        let p: RegisterParams = parse(params)?;
        validate_agent_name(&p.name).map_err(RpcError::from)?;

        let provider_name = match p.provider {
            Some(name) => name,
            None => self
                .store
                .get_config(keys::DEFAULT_PROVIDER)
                .map_err(RpcError::from)?
                .unwrap_or_else(|| "claude".to_string()),
        };
        let provider = ProviderKind::parse(&provider_name).ok_or_else(|| {
            RpcError::invalid_params(format!("unknown provider '{}'", provider_name))
        })?;
        let reasoning_effort = match p.reasoning_effort.as_deref() {
            Some(raw) => Some(ReasoningEffort::parse(raw).ok_or_else(|| {
                RpcError::invalid_params(format!("unknown reasoning effort '{}'", raw))
            })?),
            None => None,
        };
        let permission_level = match p.permission_level.as_deref() {
            Some(raw) => PermissionLevel::parse(raw).map_err(RpcError::from)?,
            None => PermissionLevel::Standard,
        };
        let workspace = match p.workspace {
            Some(path) => std::path::PathBuf::from(path),
            None => self.paths.agents_dir.join(&p.name).join("workspace"),
        };

        let agent = crate::agent::types::Agent {
            name: p.name.clone(),
            token: format!("{}{}", new_id(), new_id()),
            description: p.description,
            workspace,
            provider,
            model: p.model,
            reasoning_effort,
            permission_level,
            session_policy: None,
            metadata: None,
            created_at: now_ms(),
            last_seen_at: None,
        };
        self.store.create_agent(&agent).map_err(RpcError::from)?;
        info!("agent {} registered", agent.name);
        Ok(json!({
            "agent": to_value(&agent)?,
            "token": agent.token,
        }))
    }

    async fn agent_status(&self, name: &str) -> Result<Value, RpcError> {
        let agent = self.require_agent(name).map_err(RpcError::from)?;
        let pending = self
            .store
            .list_pending_inbox(name, Some(now_ms()))
            .map_err(RpcError::from)?;
        let runs = self
            .store
            .list_runs_for_agent(name, 5)
            .map_err(RpcError::from)?;
        let bindings = self.store.list_bindings(name).map_err(RpcError::from)?;
        Ok(json!({
            "agent": to_value(&agent)?,
            "running": self.executor.is_running(name).await,
            "session": to_value(&self.executor.session_snapshot(name).await)?,
            "pendingInbox": pending.len(),
            "recentRuns": to_value(&runs)?,
            "bindings": to_value(&bindings)?,
        }))
    }

    async fn agent_set(&self, params: &Value) -> Result<Value, RpcError> {
        self.authorize("agent.set", params)?;
        let p: SetParams = parse(params)?;
        let mut agent = self.require_agent(&p.name).map_err(RpcError::from)?;

        if let Some(description) = p.description {
            agent.description = if description.is_empty() {
                None
            } else {
                Some(description)
            };
        }
        if let Some(provider) = p.provider {
            agent.provider = ProviderKind::parse(&provider).ok_or_else(|| {
                RpcError::invalid_params(format!("unknown provider '{}'", provider))
            })?;
        }
        if let Some(model) = p.model {
            agent.model = match model {
                Value::Null => None,
                Value::String(s) if s.is_empty() => None,
                Value::String(s) => Some(s),
                _ => return Err(RpcError::invalid_params("model must be a string or null")),
            };
        }
        if let Some(effort) = p.reasoning_effort {
            agent.reasoning_effort = match effort {
                Value::Null => None,
                Value::String(s) => Some(ReasoningEffort::parse(&s).ok_or_else(|| {
                    RpcError::invalid_params(format!("unknown reasoning effort '{}'", s))
                })?),
                _ => {
                    return Err(RpcError::invalid_params(
                        "reasoningEffort must be a string or null",
                    ));
                }
            };
        }
        if let Some(level) = p.permission_level {
            agent.permission_level = PermissionLevel::parse(&level).map_err(RpcError::from)?;
        }
        if let Some(workspace) = p.workspace {
            agent.workspace = std::path::PathBuf::from(workspace);
        }
        if let Some(metadata) = p.metadata {
            agent.metadata = if metadata.is_null() {
                None
            } else {
                Some(metadata)
            };
        }
        self.store.update_agent(&agent).map_err(RpcError::from)?;
        to_value(&agent)
    }

    async fn reaction_set(&self, params: &Value) -> Result<Value, RpcError> {
        let principal = self.authorize("reaction.set", params)?;
        let p: ReactionParams = parse(params)?;
        let agent_name = match principal.agent_name() {
            Some(name) => name.to_string(),
            None => p.agent_name.clone().ok_or_else(|| {
                RpcError::invalid_params("agentName required when called with the boss token")
            })?,
        };
        let binding = self
            .store
            .get_binding_for_agent(&agent_name, &p.adapter_type)
            .map_err(RpcError::from)?
            .ok_or_else(|| {
                RpcError::from(HibossError::Delivery(
                    crate::errors::DeliveryFailure::new(crate::errors::DeliveryErrorKind::NoBinding)
                        .with_detail(format!(
                            "agent '{}' has no {} binding",
                            agent_name, p.adapter_type
                        )),
                ))
            })?;
        let adapter = self
            .adapters
            .get(&p.adapter_type, &binding.adapter_token)
            .ok_or_else(|| {
                RpcError::from(HibossError::Delivery(
                    crate::errors::DeliveryFailure::new(
                        crate::errors::DeliveryErrorKind::AdapterNotLoaded,
                    )
                    .with_detail(format!("no loaded {} adapter", p.adapter_type)),
                ))
            })?;
        adapter
            .set_reaction(&p.chat_id, &p.channel_message_id, &p.emoji)
            .await
            .map_err(|e| {
                RpcError::from(HibossError::Delivery(
                    crate::errors::DeliveryFailure::new(crate::errors::DeliveryErrorKind::SendFailed)
                        .with_detail(e.to_string()),
                ))
            })?;
        Ok(json!({"set": true}))
    }

    async fn setup_execute(&self, params: &Value) -> Result<Value, RpcError> {
        if self.store.setup_completed().map_err(RpcError::from)? {
            // Re-running setup requires the boss
            let token = token_of(params)?;
            if !self.store.verify_boss_token(&token).map_err(RpcError::from)? {
                return Err(RpcError::from(HibossError::invalid_token()));
            }
        }
        let p: SetupParams = parse(params)?;
        if p.boss_token.len() < 8 {
            return Err(RpcError::invalid_params("boss token too short"));
        }
        if let Some(tz) = &p.boss_timezone {
            crate::time::parse_timezone(tz).map_err(RpcError::from)?;
        }
        if let Some(provider) = &p.default_provider {
            if ProviderKind::parse(provider).is_none() {
                return Err(RpcError::invalid_params(format!(
                    "unknown provider '{}'",
                    provider
                )));
            }
        }

        self.store
            .set_config(keys::BOSS_NAME, &p.boss_name)
            .map_err(RpcError::from)?;
        self.store
            .set_config(keys::BOSS_TOKEN_HASH, &hash_boss_token(&p.boss_token))
            .map_err(RpcError::from)?;
        if let Some(tz) = &p.boss_timezone {
            self.store
                .set_config(keys::BOSS_TIMEZONE, tz)
                .map_err(RpcError::from)?;
        }
        if let Some(provider) = &p.default_provider {
            self.store
                .set_config(keys::DEFAULT_PROVIDER, provider)
                .map_err(RpcError::from)?;
        }
        for (adapter_type, boss_id) in &p.adapter_boss_ids {
            self.store
                .set_config(&keys::adapter_boss_id(adapter_type), boss_id)
                .map_err(RpcError::from)?;
        }
        self.store
            .set_config(keys::SETUP_COMPLETED, "true")
            .map_err(RpcError::from)?;
        info!("setup completed for boss {}", p.boss_name);
        Ok(json!({"ok": true}))
    }
}
