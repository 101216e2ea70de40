//! Durable persistence.
//!
//! One SQLite file owns all daemon state. A single connection behind a mutex
//! serializes writes; reads go through the same handle (operations are short
//! and the daemon is host-local). Read paths return value objects; row
//! handles never escape this module. Writes that cross entities happen in
//! one transaction.

mod schema;

use crate::agent::types::{Agent, AgentBinding, AgentRun, PermissionLevel, RunStatus};
use crate::cron::types::CronSchedule;
use crate::envelope::{
    Address, DeliveryErrorMeta, Envelope, EnvelopeContent, EnvelopeMetadata, EnvelopeStatus,
    NewEnvelope,
};
use crate::errors::{DeliveryErrorKind, HibossError, HibossResult};
use crate::ids::{IdLookup, is_valid_prefix, new_id};
use crate::providers::{ProviderKind, ReasoningEffort};
use crate::time::now_ms;
use hmac::{Hmac, Mac};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use subtle::ConstantTimeEq;

/// Domain-separation key for the boss token digest.
const BOSS_TOKEN_DOMAIN: &[u8] = b"hiboss:boss-token:v1";

/// Tables that support short-id prefix lookup.
#[derive(Debug, Clone, Copy)]
pub enum IdTable {
    Envelopes,
    CronSchedules,
    AgentRuns,
}

impl IdTable {
    fn table_name(self) -> &'static str {
        match self {
            IdTable::Envelopes => "envelopes",
            IdTable::CronSchedules => "cron_schedules",
            IdTable::AgentRuns => "agent_runs",
        }
    }

    pub fn entity(self) -> &'static str {
        match self {
            IdTable::Envelopes => "envelope",
            IdTable::CronSchedules => "cron schedule",
            IdTable::AgentRuns => "agent run",
        }
    }
}

/// Filter for `list_envelopes`.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeFilter {
    pub status: Option<EnvelopeStatus>,
    pub to: Option<String>,
    pub from: Option<String>,
    pub limit: Option<usize>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

/// Digest a boss token for storage.
pub fn hash_boss_token(token: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(BOSS_TOKEN_DOMAIN)
        .expect("HMAC accepts any key length");
    mac.update(token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of a presented token against a stored digest.
pub fn verify_boss_token_hash(token: &str, stored_hex: &str) -> bool {
    let computed = hash_boss_token(token);
    computed.as_bytes().ct_eq(stored_hex.as_bytes()).into()
}

fn constraint(e: rusqlite::Error, msg: &str) -> HibossError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return HibossError::Conflict(msg.to_string());
        }
    }
    e.into()
}

fn json_err(idx: usize, e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn addr_err(idx: usize, e: HibossError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn row_to_envelope(row: &Row<'_>) -> rusqlite::Result<Envelope> {
    let from_raw: String = row.get(1)?;
    let to_raw: String = row.get(2)?;
    let content_raw: String = row.get(4)?;
    let status_raw: String = row.get(6)?;
    let metadata_raw: Option<String> = row.get(8)?;

    let content: EnvelopeContent =
        serde_json::from_str(&content_raw).map_err(|e| json_err(4, e))?;
    let metadata: EnvelopeMetadata = match metadata_raw {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| json_err(8, e))?,
        None => EnvelopeMetadata::default(),
    };

    Ok(Envelope {
        id: row.get(0)?,
        from: Address::parse(&from_raw).map_err(|e| addr_err(1, e))?,
        to: Address::parse(&to_raw).map_err(|e| addr_err(2, e))?,
        from_boss: row.get::<_, i64>(3)? != 0,
        content,
        deliver_at: row.get(5)?,
        status: EnvelopeStatus::parse(&status_raw).map_err(|e| addr_err(6, e))?,
        created_at: row.get(7)?,
        metadata,
    })
}

const ENVELOPE_COLS: &str =
    "id, from_addr, to_addr, from_boss, content, deliver_at, status, created_at, metadata";

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let provider_raw: String = row.get(4)?;
    let effort_raw: Option<String> = row.get(6)?;
    let level_raw: String = row.get(7)?;
    let policy_raw: Option<String> = row.get(8)?;
    let metadata_raw: Option<String> = row.get(9)?;

    let provider = ProviderKind::parse(&provider_raw).ok_or_else(|| {
        addr_err(
            4,
            HibossError::validation(format!("Unknown provider '{}'", provider_raw)),
        )
    })?;
    let reasoning_effort = match effort_raw {
        Some(raw) => Some(ReasoningEffort::parse(&raw).ok_or_else(|| {
            addr_err(
                6,
                HibossError::validation(format!("Unknown reasoning effort '{}'", raw)),
            )
        })?),
        None => None,
    };
    let session_policy = match policy_raw {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| json_err(8, e))?),
        None => None,
    };
    let metadata = match metadata_raw {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| json_err(9, e))?),
        None => None,
    };

    Ok(Agent {
        name: row.get(0)?,
        token: row.get(1)?,
        description: row.get(2)?,
        workspace: PathBuf::from(row.get::<_, String>(3)?),
        provider,
        model: row.get(5)?,
        reasoning_effort,
        permission_level: PermissionLevel::parse(&level_raw).map_err(|e| addr_err(7, e))?,
        session_policy,
        metadata,
        created_at: row.get(10)?,
        last_seen_at: row.get(11)?,
    })
}

const AGENT_COLS: &str = "name, token, description, workspace, provider, model, \
     reasoning_effort, permission_level, session_policy, metadata, created_at, last_seen_at";

fn row_to_binding(row: &Row<'_>) -> rusqlite::Result<AgentBinding> {
    Ok(AgentBinding {
        agent_name: row.get(0)?,
        adapter_type: row.get(1)?,
        adapter_token: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<AgentRun> {
    let ids_raw: String = row.get(4)?;
    let status_raw: String = row.get(7)?;
    Ok(AgentRun {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        started_at: row.get(2)?,
        completed_at: row.get(3)?,
        envelope_ids: serde_json::from_str(&ids_raw).map_err(|e| json_err(4, e))?,
        final_response: row.get(5)?,
        context_length: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
        status: RunStatus::parse(&status_raw).map_err(|e| addr_err(7, e))?,
        error: row.get(8)?,
    })
}

const RUN_COLS: &str = "id, agent_name, started_at, completed_at, envelope_ids, \
     final_response, context_length, status, error";

fn row_to_cron(row: &Row<'_>) -> rusqlite::Result<CronSchedule> {
    let to_raw: String = row.get(5)?;
    let metadata_raw: Option<String> = row.get(7)?;
    Ok(CronSchedule {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        cron: row.get(2)?,
        timezone: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        to: Address::parse(&to_raw).map_err(|e| addr_err(5, e))?,
        content: row.get(6)?,
        metadata: match metadata_raw {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| json_err(7, e))?),
            None => None,
        },
        pending_envelope_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

const CRON_COLS: &str = "id, agent_name, cron, timezone, enabled, to_addr, content, \
     metadata, pending_envelope_id, created_at, updated_at";

fn metadata_to_sql(md: &EnvelopeMetadata) -> HibossResult<Option<String>> {
    if md.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(md)?))
    }
}

fn insert_envelope_tx(conn: &Connection, input: NewEnvelope, now: i64) -> HibossResult<Envelope> {
    let env = Envelope {
        id: new_id(),
        from: input.from,
        to: input.to,
        from_boss: input.from_boss,
        content: input.content,
        deliver_at: input.deliver_at,
        status: EnvelopeStatus::Pending,
        created_at: now,
        metadata: input.metadata,
    };
    conn.execute(
        "INSERT INTO envelopes (id, from_addr, to_addr, from_boss, content, deliver_at, status, created_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            env.id,
            env.from.to_string(),
            env.to.to_string(),
            i64::from(env.from_boss),
            serde_json::to_string(&env.content)?,
            env.deliver_at,
            env.status.as_str(),
            env.created_at,
            metadata_to_sql(&env.metadata)?,
        ],
    )?;
    Ok(env)
}

fn update_metadata_tx(conn: &Connection, id: &str, md: &EnvelopeMetadata) -> HibossResult<()> {
    conn.execute(
        "UPDATE envelopes SET metadata = ?2 WHERE id = ?1",
        params![id, metadata_to_sql(md)?],
    )?;
    Ok(())
}

impl Store {
    pub fn open(path: &Path) -> HibossResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> HibossResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- config ----

    pub fn get_config(&self, key: &str) -> HibossResult<Option<String>> {
        let conn = self.lock();
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_config(&self, key: &str, value: &str) -> HibossResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn setup_completed(&self) -> HibossResult<bool> {
        Ok(self.get_config("setup_completed")?.as_deref() == Some("true"))
    }

    /// Verify a presented token against the stored boss digest.
    pub fn verify_boss_token(&self, token: &str) -> HibossResult<bool> {
        match self.get_config("boss_token_hash")? {
            Some(stored) => Ok(verify_boss_token_hash(token, &stored)),
            None => Ok(false),
        }
    }

    // ---- agents ----

    pub fn create_agent(&self, agent: &Agent) -> HibossResult<()> {
        let conn = self.lock();
        conn.execute(
            &format!("INSERT INTO agents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)", AGENT_COLS),
            params![
                agent.name,
                agent.token,
                agent.description,
                agent.workspace.to_string_lossy(),
                agent.provider.as_str(),
                agent.model,
                agent.reasoning_effort.map(ReasoningEffort::as_str),
                agent.permission_level.as_str(),
                agent.session_policy.as_ref().map(serde_json::to_string).transpose()?,
                agent.metadata.as_ref().map(serde_json::to_string).transpose()?,
                agent.created_at,
                agent.last_seen_at,
            ],
        )
        .map_err(|e| constraint(e, &format!("Agent '{}' already exists", agent.name)))?;
        Ok(())
    }

    pub fn get_agent(&self, name: &str) -> HibossResult<Option<Agent>> {
        let conn = self.lock();
        let agent = conn
            .query_row(
                &format!("SELECT {} FROM agents WHERE name = ?1", AGENT_COLS),
                params![name],
                row_to_agent,
            )
            .optional()?;
        Ok(agent)
    }

    pub fn get_agent_by_token(&self, token: &str) -> HibossResult<Option<Agent>> {
        let conn = self.lock();
        let agent = conn
            .query_row(
                &format!("SELECT {} FROM agents WHERE token = ?1", AGENT_COLS),
                params![token],
                row_to_agent,
            )
            .optional()?;
        Ok(agent)
    }

    pub fn list_agents(&self) -> HibossResult<Vec<Agent>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM agents ORDER BY name", AGENT_COLS))?;
        let agents = stmt
            .query_map([], row_to_agent)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(agents)
    }

    /// Full-row update (everything except name and created_at).
    pub fn update_agent(&self, agent: &Agent) -> HibossResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE agents SET token = ?2, description = ?3, workspace = ?4, provider = ?5,
                    model = ?6, reasoning_effort = ?7, permission_level = ?8,
                    session_policy = ?9, metadata = ?10, last_seen_at = ?11
             WHERE name = ?1",
            params![
                agent.name,
                agent.token,
                agent.description,
                agent.workspace.to_string_lossy(),
                agent.provider.as_str(),
                agent.model,
                agent.reasoning_effort.map(ReasoningEffort::as_str),
                agent.permission_level.as_str(),
                agent
                    .session_policy
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                agent.metadata.as_ref().map(serde_json::to_string).transpose()?,
                agent.last_seen_at,
            ],
        )?;
        if updated == 0 {
            return Err(HibossError::NotFound {
                entity: "agent",
                id: agent.name.clone(),
            });
        }
        Ok(())
    }

    pub fn touch_agent_last_seen(&self, name: &str, now: i64) -> HibossResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE agents SET last_seen_at = ?2 WHERE name = ?1",
            params![name, now],
        )?;
        Ok(())
    }

    /// Delete an agent; bindings cascade.
    pub fn delete_agent(&self, name: &str) -> HibossResult<bool> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM agents WHERE name = ?1", params![name])?;
        Ok(deleted > 0)
    }

    // ---- bindings ----

    /// Bind an agent to an adapter credential. Replaces the agent's existing
    /// binding for the adapter type; fails if the credential is already
    /// bound to another agent.
    pub fn upsert_binding(&self, binding: &AgentBinding) -> HibossResult<()> {
        let conn = self.lock();
        let holder: Option<String> = conn
            .query_row(
                "SELECT agent_name FROM agent_bindings WHERE adapter_type = ?1 AND adapter_token = ?2",
                params![binding.adapter_type, binding.adapter_token],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(holder) = holder {
            if holder != binding.agent_name {
                return Err(HibossError::Conflict(format!(
                    "Adapter credential already bound to agent '{}'",
                    holder
                )));
            }
        }
        conn.execute(
            "DELETE FROM agent_bindings WHERE agent_name = ?1 AND adapter_type = ?2",
            params![binding.agent_name, binding.adapter_type],
        )?;
        conn.execute(
            "INSERT INTO agent_bindings (agent_name, adapter_type, adapter_token, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                binding.agent_name,
                binding.adapter_type,
                binding.adapter_token,
                binding.created_at,
            ],
        )
        .map_err(|e| constraint(e, "Binding conflicts with an existing binding"))?;
        Ok(())
    }

    pub fn delete_binding(&self, agent_name: &str, adapter_type: &str) -> HibossResult<bool> {
        let conn = self.lock();
        let deleted = conn.execute(
            "DELETE FROM agent_bindings WHERE agent_name = ?1 AND adapter_type = ?2",
            params![agent_name, adapter_type],
        )?;
        Ok(deleted > 0)
    }

    pub fn get_binding_by_credential(
        &self,
        adapter_type: &str,
        adapter_token: &str,
    ) -> HibossResult<Option<AgentBinding>> {
        let conn = self.lock();
        let binding = conn
            .query_row(
                "SELECT agent_name, adapter_type, adapter_token, created_at
                 FROM agent_bindings WHERE adapter_type = ?1 AND adapter_token = ?2",
                params![adapter_type, adapter_token],
                row_to_binding,
            )
            .optional()?;
        Ok(binding)
    }

    pub fn get_binding_for_agent(
        &self,
        agent_name: &str,
        adapter_type: &str,
    ) -> HibossResult<Option<AgentBinding>> {
        let conn = self.lock();
        let binding = conn
            .query_row(
                "SELECT agent_name, adapter_type, adapter_token, created_at
                 FROM agent_bindings WHERE agent_name = ?1 AND adapter_type = ?2",
                params![agent_name, adapter_type],
                row_to_binding,
            )
            .optional()?;
        Ok(binding)
    }

    pub fn list_bindings(&self, agent_name: &str) -> HibossResult<Vec<AgentBinding>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT agent_name, adapter_type, adapter_token, created_at
             FROM agent_bindings WHERE agent_name = ?1 ORDER BY adapter_type",
        )?;
        let bindings = stmt
            .query_map(params![agent_name], row_to_binding)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bindings)
    }

    // ---- envelopes ----

    pub fn create_envelope(&self, input: NewEnvelope) -> HibossResult<Envelope> {
        let conn = self.lock();
        insert_envelope_tx(&conn, input, now_ms())
    }

    pub fn get_envelope(&self, id: &str) -> HibossResult<Option<Envelope>> {
        let conn = self.lock();
        let env = conn
            .query_row(
                &format!("SELECT {} FROM envelopes WHERE id = ?1", ENVELOPE_COLS),
                params![id],
                row_to_envelope,
            )
            .optional()?;
        Ok(env)
    }

    /// Status transition with `done` terminal: `done -> pending` is refused.
    pub fn update_envelope_status(&self, id: &str, status: EnvelopeStatus) -> HibossResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM envelopes WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(HibossError::NotFound {
                entity: "envelope",
                id: id.to_string(),
            });
        };
        if current == "done" && status == EnvelopeStatus::Pending {
            return Err(HibossError::validation(
                "Envelope status 'done' is terminal",
            ));
        }
        tx.execute(
            "UPDATE envelopes SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn update_envelope_metadata(
        &self,
        id: &str,
        metadata: &EnvelopeMetadata,
    ) -> HibossResult<()> {
        let conn = self.lock();
        update_metadata_tx(&conn, id, metadata)
    }

    /// Due channel-destined envelopes, oldest scheduled first.
    pub fn list_due_channel_envelopes(&self, now: i64, limit: usize) -> HibossResult<Vec<Envelope>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM envelopes
             WHERE status = 'pending' AND to_addr LIKE 'channel:%'
               AND (deliver_at IS NULL OR deliver_at <= ?1)
             ORDER BY (deliver_at IS NOT NULL), deliver_at, created_at
             LIMIT ?2",
            ENVELOPE_COLS
        ))?;
        let envs = stmt
            .query_map(params![now, limit as i64], row_to_envelope)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(envs)
    }

    /// Distinct agent names with a due pending envelope.
    pub fn list_agent_names_with_due_envelopes(&self, now: i64) -> HibossResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT substr(to_addr, 7) FROM envelopes
             WHERE status = 'pending' AND to_addr LIKE 'agent:%'
               AND (deliver_at IS NULL OR deliver_at <= ?1)",
        )?;
        let names = stmt
            .query_map(params![now], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// The earliest pending envelope, `deliver_at` nulls first (due now).
    pub fn next_scheduled_envelope(&self) -> HibossResult<Option<Envelope>> {
        let conn = self.lock();
        let env = conn
            .query_row(
                &format!(
                    "SELECT {} FROM envelopes WHERE status = 'pending'
                     ORDER BY (deliver_at IS NOT NULL), deliver_at, created_at
                     LIMIT 1",
                    ENVELOPE_COLS
                ),
                [],
                row_to_envelope,
            )
            .optional()?;
        Ok(env)
    }

    /// Earliest strictly-future `deliver_at` among pending envelopes.
    pub fn next_future_deliver_at(&self, now: i64) -> HibossResult<Option<i64>> {
        let conn = self.lock();
        let min: Option<i64> = conn.query_row(
            "SELECT MIN(deliver_at) FROM envelopes
             WHERE status = 'pending' AND deliver_at > ?1",
            params![now],
            |row| row.get(0),
        )?;
        Ok(min)
    }

    /// Whether any due channel-destined envelope is still pending.
    pub fn has_due_channel_backlog(&self, now: i64) -> HibossResult<bool> {
        let conn = self.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM envelopes
                 WHERE status = 'pending' AND to_addr LIKE 'channel:%'
                   AND (deliver_at IS NULL OR deliver_at <= ?1)
                 LIMIT 1",
                params![now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Pending inbox for an agent in drain order. With `due_now`, only
    /// envelopes due at that instant.
    pub fn list_pending_inbox(
        &self,
        agent_name: &str,
        due_now: Option<i64>,
    ) -> HibossResult<Vec<Envelope>> {
        let conn = self.lock();
        let to_addr = format!("agent:{}", agent_name);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM envelopes
             WHERE status = 'pending' AND to_addr = ?1
               AND (?2 IS NULL OR deliver_at IS NULL OR deliver_at <= ?2)
             ORDER BY (deliver_at IS NOT NULL), deliver_at, created_at",
            ENVELOPE_COLS
        ))?;
        let envs = stmt
            .query_map(params![to_addr, due_now], row_to_envelope)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(envs)
    }

    pub fn list_envelopes(&self, filter: &EnvelopeFilter) -> HibossResult<Vec<Envelope>> {
        let conn = self.lock();
        let mut sql = format!("SELECT {} FROM envelopes WHERE 1=1", ENVELOPE_COLS);
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(status) = filter.status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(to) = &filter.to {
            sql.push_str(&format!(" AND to_addr = ?{}", args.len() + 1));
            args.push(Box::new(to.clone()));
        }
        if let Some(from) = &filter.from {
            sql.push_str(&format!(" AND from_addr = ?{}", args.len() + 1));
            args.push(Box::new(from.clone()));
        }
        sql.push_str(" ORDER BY created_at DESC");
        sql.push_str(&format!(" LIMIT {}", filter.limit.unwrap_or(50)));

        let mut stmt = conn.prepare(&sql)?;
        let envs = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(AsRef::as_ref)),
                row_to_envelope,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(envs)
    }

    pub fn count_pending_envelopes(&self) -> HibossResult<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM envelopes WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Startup sweep: mark due channel envelopes whose sender cannot resolve
    /// to a bound agent as done, recording a no-binding delivery error.
    /// Bounded by `cap` per call.
    pub fn clear_orphan_channel_envelopes(&self, now: i64, cap: usize) -> HibossResult<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let envs = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM envelopes
                 WHERE status = 'pending' AND to_addr LIKE 'channel:%'
                   AND (deliver_at IS NULL OR deliver_at <= ?1)
                 ORDER BY (deliver_at IS NOT NULL), deliver_at, created_at
                 LIMIT ?2",
                ENVELOPE_COLS
            ))?;
            stmt.query_map(params![now, cap as i64], row_to_envelope)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut cleared = 0;
        for mut env in envs {
            let Address::Channel { adapter, .. } = &env.to else {
                continue;
            };
            let bound = match env.from.agent_name() {
                Some(agent_name) => tx
                    .query_row(
                        "SELECT 1 FROM agent_bindings WHERE agent_name = ?1 AND adapter_type = ?2",
                        params![agent_name, adapter],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some(),
                None => false,
            };
            if bound {
                continue;
            }
            env.metadata.last_delivery_error = Some(DeliveryErrorMeta {
                kind: DeliveryErrorKind::NoBinding,
                detail: Some("cleared by startup orphan sweep".to_string()),
                hint: None,
                at: now,
            });
            tx.execute(
                "UPDATE envelopes SET status = 'done', metadata = ?2 WHERE id = ?1",
                params![env.id, metadata_to_sql(&env.metadata)?],
            )?;
            cleared += 1;
        }
        tx.commit()?;
        Ok(cleared)
    }

    /// Abort cleanup: mark the agent's due, pending, non-cron envelopes done
    /// with a cancellation marker. Cron-origin envelopes are left pending.
    /// Returns the cancelled envelopes.
    pub fn cancel_due_agent_inbox(
        &self,
        agent_name: &str,
        now: i64,
    ) -> HibossResult<Vec<Envelope>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let to_addr = format!("agent:{}", agent_name);
        let envs = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM envelopes
                 WHERE status = 'pending' AND to_addr = ?1
                   AND (deliver_at IS NULL OR deliver_at <= ?2)
                 ORDER BY (deliver_at IS NOT NULL), deliver_at, created_at",
                ENVELOPE_COLS
            ))?;
            stmt.query_map(params![to_addr, now], row_to_envelope)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut cancelled = Vec::new();
        for mut env in envs {
            if env.is_cron_origin() {
                continue;
            }
            env.metadata.cancelled = Some(true);
            env.status = EnvelopeStatus::Done;
            tx.execute(
                "UPDATE envelopes SET status = 'done', metadata = ?2 WHERE id = ?1",
                params![env.id, metadata_to_sql(&env.metadata)?],
            )?;
            cancelled.push(env);
        }
        tx.commit()?;
        Ok(cancelled)
    }

    // ---- short-id lookup ----

    pub fn find_id_by_prefix(&self, table: IdTable, prefix: &str) -> HibossResult<IdLookup> {
        if !is_valid_prefix(prefix) {
            return Err(HibossError::validation(format!(
                "Invalid id prefix '{}'",
                prefix
            )));
        }
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM {} WHERE id LIKE ?1 || '%' LIMIT 16",
            table.table_name()
        ))?;
        let matches = stmt
            .query_map(params![prefix], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(IdLookup::from_matches(matches))
    }

    // ---- agent runs ----

    pub fn create_run(&self, run: &AgentRun) -> HibossResult<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO agent_runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                RUN_COLS
            ),
            params![
                run.id,
                run.agent_name,
                run.started_at,
                run.completed_at,
                serde_json::to_string(&run.envelope_ids)?,
                run.final_response,
                run.context_length.map(|v| v as i64),
                run.status.as_str(),
                run.error,
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> HibossResult<Option<AgentRun>> {
        let conn = self.lock();
        let run = conn
            .query_row(
                &format!("SELECT {} FROM agent_runs WHERE id = ?1", RUN_COLS),
                params![id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    pub fn list_runs_for_agent(&self, agent_name: &str, limit: usize) -> HibossResult<Vec<AgentRun>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agent_runs WHERE agent_name = ?1
             ORDER BY started_at DESC LIMIT ?2",
            RUN_COLS
        ))?;
        let runs = stmt
            .query_map(params![agent_name, limit as i64], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// Complete a run: mark its envelopes done and finalize the run row in
    /// one transaction.
    pub fn complete_run(
        &self,
        run_id: &str,
        envelope_ids: &[String],
        final_response: &str,
        context_length: Option<u64>,
        now: i64,
    ) -> HibossResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for id in envelope_ids {
            tx.execute(
                "UPDATE envelopes SET status = 'done' WHERE id = ?1 AND status = 'pending'",
                params![id],
            )?;
        }
        tx.execute(
            "UPDATE agent_runs SET status = 'completed', completed_at = ?2,
                    final_response = ?3, context_length = ?4
             WHERE id = ?1",
            params![
                run_id,
                now,
                final_response,
                context_length.map(|v| v as i64)
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn fail_run(&self, run_id: &str, error: &str, now: i64) -> HibossResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE agent_runs SET status = 'failed', completed_at = ?2, error = ?3 WHERE id = ?1",
            params![run_id, now, error],
        )?;
        Ok(())
    }

    pub fn cancel_run(&self, run_id: &str, now: i64) -> HibossResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE agent_runs SET status = 'cancelled', completed_at = ?2 WHERE id = ?1",
            params![run_id, now],
        )?;
        Ok(())
    }

    /// Startup recovery: any `running` row belongs to a previous daemon
    /// process and is marked failed.
    pub fn fail_stale_running_runs(&self, now: i64) -> HibossResult<usize> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE agent_runs SET status = 'failed', completed_at = ?1,
                    error = 'daemon restarted mid-run'
             WHERE status = 'running'",
            params![now],
        )?;
        Ok(updated)
    }

    // ---- cron schedules ----

    pub fn get_cron_schedule(&self, id: &str) -> HibossResult<Option<CronSchedule>> {
        let conn = self.lock();
        let sched = conn
            .query_row(
                &format!("SELECT {} FROM cron_schedules WHERE id = ?1", CRON_COLS),
                params![id],
                row_to_cron,
            )
            .optional()?;
        Ok(sched)
    }

    pub fn list_cron_schedules(&self) -> HibossResult<Vec<CronSchedule>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM cron_schedules ORDER BY created_at",
            CRON_COLS
        ))?;
        let scheds = stmt
            .query_map([], row_to_cron)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(scheds)
    }

    /// Insert a schedule and, if given, materialize its first pending
    /// envelope in the same transaction.
    pub fn create_cron_schedule(
        &self,
        sched: &CronSchedule,
        first_envelope: Option<NewEnvelope>,
    ) -> HibossResult<Option<Envelope>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = now_ms();
        let env = match first_envelope {
            Some(input) => Some(insert_envelope_tx(&tx, input, now)?),
            None => None,
        };
        tx.execute(
            &format!(
                "INSERT INTO cron_schedules ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                CRON_COLS
            ),
            params![
                sched.id,
                sched.agent_name,
                sched.cron,
                sched.timezone,
                i64::from(sched.enabled),
                sched.to.to_string(),
                sched.content,
                sched.metadata.as_ref().map(serde_json::to_string).transpose()?,
                env.as_ref().map(|e| e.id.clone()),
                sched.created_at,
                sched.updated_at,
            ],
        )?;
        tx.commit()?;
        Ok(env)
    }

    pub fn update_cron_enabled(&self, id: &str, enabled: bool, now: i64) -> HibossResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE cron_schedules SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, i64::from(enabled), now],
        )?;
        if updated == 0 {
            return Err(HibossError::NotFound {
                entity: "cron schedule",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn delete_cron_schedule(&self, id: &str) -> HibossResult<bool> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM cron_schedules WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Materialize the next envelope for a schedule, guarded against double
    /// advancement: the schedule's `pending_envelope_id` must still equal
    /// `expect_pending` or the call is a no-op returning `None`.
    pub fn advance_cron_pending(
        &self,
        schedule_id: &str,
        expect_pending: Option<&str>,
        next: NewEnvelope,
        now: i64,
    ) -> HibossResult<Option<Envelope>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current: Option<Option<String>> = tx
            .query_row(
                "SELECT pending_envelope_id FROM cron_schedules WHERE id = ?1",
                params![schedule_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(None);
        };
        if current.as_deref() != expect_pending {
            return Ok(None);
        }
        let env = insert_envelope_tx(&tx, next, now)?;
        tx.execute(
            "UPDATE cron_schedules SET pending_envelope_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![schedule_id, env.id, now],
        )?;
        tx.commit()?;
        Ok(Some(env))
    }

    /// Cancel a schedule's pending envelope (mark done) and clear the
    /// pointer. Returns the cancelled envelope id, if there was one.
    pub fn cancel_cron_pending(&self, schedule_id: &str, now: i64) -> HibossResult<Option<String>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let pending: Option<Option<String>> = tx
            .query_row(
                "SELECT pending_envelope_id FROM cron_schedules WHERE id = ?1",
                params![schedule_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(pending) = pending else {
            return Ok(None);
        };
        let Some(env_id) = pending else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE envelopes SET status = 'done' WHERE id = ?1 AND status = 'pending'",
            params![env_id],
        )?;
        tx.execute(
            "UPDATE cron_schedules SET pending_envelope_id = NULL, updated_at = ?2 WHERE id = ?1",
            params![schedule_id, now],
        )?;
        tx.commit()?;
        Ok(Some(env_id))
    }
}
