//! Envelope routing.
//!
//! Three paths: inbound (channel message -> pending envelope -> agent wake),
//! outbound (agent envelope -> bound adapter), and deferral (not-yet-due
//! envelopes are left to the one-shot scheduler). Delivery failures are
//! recorded on the envelope and the envelope stays pending so the scheduler
//! can retry.

pub mod events;

use crate::channels::registry::AdapterRegistry;
use crate::channels::{AdapterSendError, ChannelCommand, ChannelMessage, CommandKind, SendOptions};
use crate::envelope::{
    Address, AuthorMeta, ChatMeta, DeliveryErrorMeta, Envelope, EnvelopeContent, EnvelopeMetadata,
    EnvelopeStatus, NewEnvelope,
};
use crate::errors::{DeliveryErrorKind, DeliveryFailure, HibossError, HibossResult};
use crate::store::Store;
use crate::time::now_ms;
use async_trait::async_trait;
use events::EventHub;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Executor surface the router and scheduler drive. Registered after the
/// executor exists; deliveries before registration leave envelopes pending.
#[async_trait]
pub trait AgentControl: Send + Sync {
    /// Wake an agent: drain its due inbox if a run is not already underway.
    async fn check_and_run(&self, agent_name: &str);
    /// Request a session refresh at the next run boundary.
    async fn request_refresh(&self, agent_name: &str, reason: &str);
    /// Cancel the agent's active run, if any. Returns whether one was live.
    async fn abort_run(&self, agent_name: &str) -> HibossResult<bool>;
    /// One-line status summary for chat commands.
    async fn status_line(&self, agent_name: &str) -> String;
}

pub struct Router {
    store: Arc<Store>,
    adapters: Arc<AdapterRegistry>,
    events: Arc<EventHub>,
    agent_handler: RwLock<Option<Arc<dyn AgentControl>>>,
}

impl Router {
    pub fn new(store: Arc<Store>, adapters: Arc<AdapterRegistry>, events: Arc<EventHub>) -> Self {
        Self {
            store,
            adapters,
            events,
            agent_handler: RwLock::new(None),
        }
    }

    pub fn set_agent_handler(&self, handler: Arc<dyn AgentControl>) {
        *self
            .agent_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn agent_handler(&self) -> Option<Arc<dyn AgentControl>> {
        self.agent_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// Whether `username` identifies the boss on this adapter type:
    /// case-insensitive match against `adapter_boss_id_<type>` config, with
    /// one leading `@` stripped from the presented username.
    pub fn is_boss(&self, adapter_type: &str, username: Option<&str>) -> bool {
        let Some(username) = username else {
            return false;
        };
        let key = format!("adapter_boss_id_{}", adapter_type);
        let Ok(Some(boss_id)) = self.store.get_config(&key) else {
            return false;
        };
        let presented = username.strip_prefix('@').unwrap_or(username);
        presented.eq_ignore_ascii_case(&boss_id)
    }

    /// A message arrived from a channel. Resolves the binding, persists a
    /// pending envelope, and delivers immediately when due. Messages on
    /// unbound credentials are dropped (with a courtesy reply if the sender
    /// is the boss).
    pub async fn inbound_from_channel(
        &self,
        adapter_type: &str,
        adapter_token: &str,
        msg: ChannelMessage,
    ) -> HibossResult<Option<Envelope>> {
        let Some(binding) = self
            .store
            .get_binding_by_credential(adapter_type, adapter_token)?
        else {
            debug!(
                "dropping inbound {} message: no binding for credential",
                adapter_type
            );
            if self.is_boss(adapter_type, msg.author.username.as_deref()) {
                if let Some(adapter) = self.adapters.get(adapter_type, adapter_token) {
                    let reply = EnvelopeContent::text(
                        "This bot is not configured yet. Bind an agent to it first.",
                    );
                    if let Err(e) = adapter
                        .send_message(&msg.chat.id, &reply, &SendOptions::default())
                        .await
                    {
                        warn!("failed to send not-configured reply: {}", e);
                    }
                }
            }
            return Ok(None);
        };

        let from_boss = self.is_boss(adapter_type, msg.author.username.as_deref());
        let input = NewEnvelope {
            from: Address::channel(adapter_type, &msg.chat.id),
            to: Address::agent(&binding.agent_name),
            from_boss,
            content: msg.content,
            deliver_at: None,
            metadata: EnvelopeMetadata {
                platform: Some(msg.platform),
                channel_message_id: Some(msg.id),
                author: Some(AuthorMeta {
                    id: msg.author.id,
                    username: msg.author.username,
                    display_name: msg.author.display_name,
                }),
                chat: Some(ChatMeta {
                    id: msg.chat.id,
                    name: msg.chat.name,
                }),
                in_reply_to: msg.in_reply_to,
                ..Default::default()
            },
        };
        let (env, _deliver_error) = self.route_envelope(input).await?;
        Ok(Some(env))
    }

    /// Persist an envelope, publish its creation, and deliver when due.
    /// Insert errors propagate; delivery errors are returned alongside the
    /// persisted envelope (which stays pending).
    pub async fn route_envelope(
        &self,
        input: NewEnvelope,
    ) -> HibossResult<(Envelope, Option<HibossError>)> {
        let env = self.store.create_envelope(input)?;
        self.events.publish_created(&env).await;

        let deliver_error = if env.is_due(now_ms()) {
            self.deliver_envelope(&env).await.err()
        } else {
            None
        };
        // Return the post-delivery row (status / recorded failure current)
        let env = self.store.get_envelope(&env.id)?.unwrap_or(env);
        Ok((env, deliver_error))
    }

    /// Deliver one due envelope to its destination.
    ///
    /// Agent destinations wake the executor and stay pending until a run
    /// drains them. Channel destinations go out through the sender's bound
    /// adapter and are marked done on success.
    pub async fn deliver_envelope(&self, env: &Envelope) -> HibossResult<()> {
        match &env.to {
            Address::Agent(name) => {
                if let Some(handler) = self.agent_handler() {
                    handler.check_and_run(name).await;
                } else {
                    debug!(
                        "no agent handler registered; envelope {} stays pending",
                        env.id
                    );
                }
                Ok(())
            }
            Address::Channel { adapter, chat_id } => {
                self.deliver_to_channel(env, adapter, chat_id).await
            }
        }
    }

    async fn deliver_to_channel(
        &self,
        env: &Envelope,
        adapter_type: &str,
        chat_id: &str,
    ) -> HibossResult<()> {
        let Some(sender) = env.from.agent_name() else {
            return Err(HibossError::validation(format!(
                "Channel delivery requires an agent sender, got '{}'",
                env.from
            )));
        };

        let Some(binding) = self.store.get_binding_for_agent(sender, adapter_type)? else {
            let failure = DeliveryFailure::new(DeliveryErrorKind::NoBinding).with_detail(format!(
                "agent '{}' has no {} binding",
                sender, adapter_type
            ));
            return Err(self.record_delivery_failure(env, failure)?);
        };

        let Some(adapter) = self.adapters.get(adapter_type, &binding.adapter_token) else {
            let failure = DeliveryFailure::new(DeliveryErrorKind::AdapterNotLoaded)
                .with_detail(format!("no loaded {} adapter for binding", adapter_type));
            return Err(self.record_delivery_failure(env, failure)?);
        };

        let opts = SendOptions {
            parse_mode: env.metadata.parse_mode.clone(),
            reply_to_message_id: self.resolve_reply_target(env)?,
        };

        match adapter.send_message(chat_id, &env.content, &opts).await {
            Ok(sent_message_id) => {
                let mut metadata = env.metadata.clone();
                if let Some(id) = sent_message_id {
                    metadata.channel_message_id = Some(id);
                }
                metadata.last_delivery_error = None;
                self.store.update_envelope_metadata(&env.id, &metadata)?;
                self.store
                    .update_envelope_status(&env.id, EnvelopeStatus::Done)?;
                info!("delivered envelope {} to {}", env.id, env.to);

                let mut done = env.clone();
                done.status = EnvelopeStatus::Done;
                done.metadata = metadata;
                self.events.publish_done(&done).await;
                Ok(())
            }
            Err(e) => {
                let failure = classify_send_error(adapter_type, &e);
                Err(self.record_delivery_failure(env, failure)?)
            }
        }
    }

    /// Resolve the platform message id to thread a reply under.
    ///
    /// Only `replyToEnvelopeId` participates: the parent must live on the
    /// same adapter and chat as this envelope's destination, otherwise the
    /// reply option is omitted. The legacy `replyToMessageId` key is
    /// ignored.
    fn resolve_reply_target(&self, env: &Envelope) -> HibossResult<Option<String>> {
        let Some(parent_id) = &env.metadata.reply_to_envelope_id else {
            return Ok(None);
        };
        let Some(parent) = self.store.get_envelope(parent_id)? else {
            debug!("reply target envelope {} not found", parent_id);
            return Ok(None);
        };
        let same_endpoint = parent.from == env.to || parent.to == env.to;
        if !same_endpoint {
            debug!(
                "reply target {} is on a different chat, omitting thread",
                parent_id
            );
            return Ok(None);
        }
        Ok(parent.metadata.channel_message_id)
    }

    /// Record a delivery failure on the envelope (which stays pending) and
    /// wrap it into the error the caller surfaces.
    fn record_delivery_failure(
        &self,
        env: &Envelope,
        failure: DeliveryFailure,
    ) -> HibossResult<HibossError> {
        warn!(
            "delivery of envelope {} failed: {} ({})",
            env.id,
            failure.kind.as_str(),
            failure.detail.as_deref().unwrap_or("no detail")
        );
        let mut metadata = env.metadata.clone();
        metadata.last_delivery_error = Some(DeliveryErrorMeta {
            kind: failure.kind,
            detail: failure.detail.clone(),
            hint: failure.hint.clone(),
            at: now_ms(),
        });
        self.store.update_envelope_metadata(&env.id, &metadata)?;
        Ok(HibossError::Delivery(failure))
    }

    /// Boss-only chat command. Adapters filter non-boss senders; the router
    /// verifies again and silently drops on mismatch.
    pub async fn inbound_command(
        &self,
        adapter_type: &str,
        adapter_token: &str,
        cmd: ChannelCommand,
    ) -> HibossResult<()> {
        if !self.is_boss(adapter_type, cmd.author.username.as_deref()) {
            debug!("dropping {:?} command from non-boss sender", cmd.kind);
            return Ok(());
        }
        let adapter = self.adapters.get(adapter_type, adapter_token);
        let reply = |text: String| {
            let adapter = adapter.clone();
            let chat_id = cmd.chat.id.clone();
            async move {
                if let Some(adapter) = adapter {
                    let content = EnvelopeContent::text(text);
                    if let Err(e) = adapter
                        .send_message(&chat_id, &content, &SendOptions::default())
                        .await
                    {
                        warn!("failed to send command reply: {}", e);
                    }
                }
            }
        };

        let Some(binding) = self
            .store
            .get_binding_by_credential(adapter_type, adapter_token)?
        else {
            reply("This bot is not configured yet. Bind an agent to it first.".to_string()).await;
            return Ok(());
        };
        let Some(handler) = self.agent_handler() else {
            reply("The daemon is still starting up, try again shortly.".to_string()).await;
            return Ok(());
        };

        let agent = &binding.agent_name;
        match cmd.kind {
            CommandKind::New => {
                handler.request_refresh(agent, "chat /new command").await;
                reply(format!("Agent {} will start a fresh session on its next run.", agent))
                    .await;
            }
            CommandKind::Status => {
                let line = handler.status_line(agent).await;
                reply(line).await;
            }
            CommandKind::Abort => match handler.abort_run(agent).await {
                Ok(true) => reply(format!("Aborted the current run of agent {}.", agent)).await,
                Ok(false) => reply(format!("Agent {} has no active run.", agent)).await,
                Err(e) => reply(format!("Abort failed: {}", e)).await,
            },
        }
        Ok(())
    }
}

/// Classify an adapter send failure into a recorded delivery error with an
/// actionable hint where one is known.
fn classify_send_error(adapter_type: &str, e: &anyhow::Error) -> DeliveryFailure {
    let mut failure = DeliveryFailure::new(DeliveryErrorKind::SendFailed);
    if let Some(send_err) = e.downcast_ref::<AdapterSendError>() {
        failure = failure.with_detail(format!("{}: {}", adapter_type, send_err));
        if send_err.description.contains("can't parse entities") {
            failure = failure.with_hint("use plain parse-mode");
        }
    } else {
        failure = failure.with_detail(format!("{}: {}", adapter_type, e));
    }
    failure
}
