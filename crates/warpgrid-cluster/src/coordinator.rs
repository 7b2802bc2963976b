//! Join coordination.
//!
//! ```text
//!   join()
//!     ├── no discovery ─────────────────────────────▶ become_master()
//!     └── discover_master(budget)
//!           ├── none / self ────────────────────────▶ become_master()
//!           └── master ── Join ──▶ JoinAccepted ───▶ sync members, joined
//!                           ├────▶ NotMaster{m} ───▶ redirect (bounded)
//!                           ├────▶ Retry ──────────▶ back off, same master
//!                           └────▶ JoinRejected ───▶ policy: standalone | fail
//! ```
//!
//! The master side of the handshake lives here too:
//! [`JoinCoordinator::handle_join_request`] validates a joiner and adds
//! it to the member list through the service context.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::address::Address;
use crate::client;
use crate::config::deadline_after;
use crate::discovery::Discovery;
use crate::error::{JoinError, JoinResult};
use crate::join::{ConfigFingerprint, JoinInfo, PROTOCOL_VERSION, RejectField};
use crate::member::Member;
use crate::security::SecurityContext;
use crate::service::ServiceContext;
use crate::state::ClusterState;
use crate::wire::Frame;

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    NotJoined,
    Joining,
    Joined,
    Rejoining,
}

/// What a node does when the master rejects it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectionPolicy {
    /// Form a singleton cluster of its own.
    #[default]
    Standalone,
    /// Report the rejection to the caller.
    Fail,
}

#[derive(Debug, Clone)]
pub struct JoinSettings {
    pub join_timeout: Duration,
    pub handshake_timeout: Duration,
    pub on_join_rejected: RejectionPolicy,
    pub max_redirects: usize,
}

impl Default for JoinSettings {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(5),
            on_join_rejected: RejectionPolicy::Standalone,
            max_redirects: 3,
        }
    }
}

pub struct JoinCoordinator {
    state: Arc<ClusterState>,
    service: Arc<ServiceContext>,
    discovery: RwLock<Option<Discovery>>,
    build_id: String,
    fingerprint: ConfigFingerprint,
    security: Option<Arc<dyn SecurityContext>>,
    phase: RwLock<JoinPhase>,
    settings: JoinSettings,
}

impl JoinCoordinator {
    pub fn new(
        state: Arc<ClusterState>,
        service: Arc<ServiceContext>,
        build_id: impl Into<String>,
        fingerprint: ConfigFingerprint,
        settings: JoinSettings,
    ) -> Self {
        Self {
            state,
            service,
            discovery: RwLock::new(None),
            build_id: build_id.into(),
            fingerprint,
            security: None,
            phase: RwLock::new(JoinPhase::NotJoined),
            settings,
        }
    }

    pub fn with_security(mut self, security: Arc<dyn SecurityContext>) -> Self {
        self.security = Some(security);
        self
    }

    pub fn install_discovery(&self, discovery: Option<Discovery>) {
        *self.discovery.write() = discovery;
    }

    /// Remove the discovery strategy, returning it so its transport can
    /// be stopped.
    pub fn take_discovery(&self) -> Option<Discovery> {
        self.discovery.write().take()
    }

    pub fn discovery(&self) -> Option<Discovery> {
        self.discovery.read().clone()
    }

    pub fn phase(&self) -> JoinPhase {
        *self.phase.read()
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    pub fn service(&self) -> &Arc<ServiceContext> {
        &self.service
    }

    pub fn security(&self) -> Option<&Arc<dyn SecurityContext>> {
        self.security.as_ref()
    }

    pub fn settings(&self) -> &JoinSettings {
        &self.settings
    }

    /// Build this node's handshake payload.
    pub fn create_join_info(&self, request: bool, with_credentials: bool) -> JoinInfo {
        let this = self.state.this_address();
        let credentials = if with_credentials {
            self.security.as_ref().map(|s| s.new_credentials(&this))
        } else {
            None
        };
        JoinInfo {
            request,
            sender: this,
            role: self.state.role(),
            protocol_version: PROTOCOL_VERSION,
            build_id: self.build_id.clone(),
            member_count: self.service.members().len() as u32,
            fingerprint: self.fingerprint.clone(),
            uuid: self.state.uuid(),
            credentials,
        }
    }

    /// Join the cluster or form one.
    pub async fn join(&self) -> JoinResult<()> {
        self.set_phase(JoinPhase::Joining);

        let result = match self.discovery() {
            None => {
                info!("no discovery configured; forming a standalone cluster");
                self.become_master().await
            }
            Some(discovery) => match self.join_via(&discovery).await {
                Err(JoinError::JoinRejected { field, reason })
                    if self.settings.on_join_rejected == RejectionPolicy::Standalone =>
                {
                    warn!(%field, %reason, "join rejected; running as a standalone cluster");
                    self.become_master().await
                }
                other => other,
            },
        };

        self.set_phase(if result.is_ok() {
            JoinPhase::Joined
        } else {
            JoinPhase::NotJoined
        });
        result
    }

    async fn join_via(&self, discovery: &Discovery) -> JoinResult<()> {
        let budget = self.settings.join_timeout;
        let deadline = deadline_after(budget);
        let local = self.create_join_info(true, true);
        let this = self.state.this_address();

        let Some(mut master) = discovery.discover_master(&local, budget).await else {
            info!(strategy = discovery.name(), "no master found; this node becomes master");
            return self.become_master().await;
        };

        let mut redirects = 0usize;
        loop {
            if !self.state.is_active() {
                self.state.set_master(None);
                return Err(JoinError::Interrupted);
            }
            if master == this {
                return self.become_master().await;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.state.set_master(None);
                return Err(JoinError::JoinTimeout(budget));
            }

            self.state.set_master(Some(master));
            let reply = client::request_join(
                master,
                &local,
                self.settings.handshake_timeout.min(remaining),
            )
            .await;

            match reply {
                Ok(Frame::JoinAccepted { master: confirmed, members }) => {
                    return self.accept(confirmed, members).await;
                }
                Ok(Frame::JoinRejected { field, reason }) => {
                    self.state.set_master(None);
                    error!(%master, %field, %reason, "join rejected by master");
                    return Err(JoinError::JoinRejected { field, reason });
                }
                Ok(Frame::NotMaster { master: Some(next) }) if next != master => {
                    redirects += 1;
                    if redirects > self.settings.max_redirects {
                        self.state.set_master(None);
                        return Err(JoinError::TooManyRedirects(redirects));
                    }
                    debug!(from = %master, to = %next, redirects, "redirected to master");
                    master = next;
                }
                Ok(Frame::NotMaster { .. }) | Ok(Frame::Retry { .. }) => {
                    debug!(%master, "master not ready; retrying");
                    tokio::time::sleep(RETRY_BACKOFF.min(remaining)).await;
                }
                Ok(other) => {
                    self.state.set_master(None);
                    warn!(%master, reply = ?other, "unexpected reply to join request");
                    return Err(JoinError::UnexpectedReply(master));
                }
                Err(e) => {
                    self.state.set_master(None);
                    self.state.failed_connection(master);
                    warn!(%master, error = %e, "could not reach master");
                    return Err(JoinError::MasterUnavailable(master));
                }
            }
        }
    }

    async fn accept(&self, master: Address, members: Vec<Member>) -> JoinResult<()> {
        self.state.set_master(Some(master));
        let count = members.len();
        if let Err(e) = self
            .service
            .submit("sync members", move |registry| registry.sync_members(&members))
            .await
        {
            self.state.set_master(None);
            return Err(e.into());
        }
        if !self.state.set_joined(true) {
            warn!(%master, "join accepted but node is no longer active");
            self.state.set_master(None);
            return Err(JoinError::Interrupted);
        }
        info!(%master, members = count, "joined cluster");
        Ok(())
    }

    /// Make this node the master of its own cluster.
    ///
    /// Fails with [`JoinError::Interrupted`] once the node has been
    /// stopped; the master address is left cleared in that case.
    pub async fn become_master(&self) -> JoinResult<()> {
        if !self.state.is_active() {
            return Err(JoinError::Interrupted);
        }
        let this = self.state.this_address();
        self.state.set_master(Some(this));

        let member = self.state.local_member();
        let added = self
            .service
            .submit("add local member", move |registry| {
                registry.add_member(member.address, member.role, &member.uuid)
            })
            .await;
        if let Err(e) = added {
            self.state.set_master(None);
            return Err(e.into());
        }

        if !self.state.set_joined(true) {
            self.state.set_master(None);
            return Err(JoinError::Interrupted);
        }
        info!(address = %this, "this node is the master");

        if let Some(discovery) = self.discovery() {
            discovery.announce(&self.create_join_info(false, false)).await;
        }
        Ok(())
    }

    /// Check whether `info` describes a node that may join this cluster.
    ///
    /// `Ok(false)` for an incompatible node; an error for a malformed
    /// fingerprint. Never touches membership.
    pub fn validate_join_request(&self, info: &JoinInfo) -> JoinResult<bool> {
        Ok(self.rejection(info)?.is_none())
    }

    fn rejection(&self, info: &JoinInfo) -> JoinResult<Option<(RejectField, String)>> {
        if info.protocol_version != PROTOCOL_VERSION {
            let reason = format!(
                "protocol version {} does not match {}",
                info.protocol_version, PROTOCOL_VERSION
            );
            warn!(sender = %info.sender, field = %RejectField::ProtocolVersion, %reason, "invalid join request");
            return Ok(Some((RejectField::ProtocolVersion, reason)));
        }
        if info.build_id != self.build_id {
            let reason = format!("build {} does not match {}", info.build_id, self.build_id);
            warn!(sender = %info.sender, field = %RejectField::BuildId, %reason, "invalid join request");
            return Ok(Some((RejectField::BuildId, reason)));
        }

        let compatible = self.fingerprint.is_compatible(&info.fingerprint).inspect_err(|e| {
            error!(sender = %info.sender, error = %e, "malformed config fingerprint in join request");
        })?;
        if !compatible {
            let field = self.fingerprint.mismatch(&info.fingerprint).unwrap_or("config");
            let reason = format!("incompatible {field}");
            warn!(sender = %info.sender, field = %RejectField::Config, %reason, "invalid join request");
            return Ok(Some((RejectField::Config, reason)));
        }

        if let Some(security) = &self.security {
            let verified = info.credentials.as_ref().is_some_and(|c| security.verify(c));
            if !verified {
                let reason = "missing or invalid credentials".to_string();
                warn!(sender = %info.sender, field = %RejectField::Credentials, "invalid join request");
                return Ok(Some((RejectField::Credentials, reason)));
            }
        }

        Ok(None)
    }

    /// Answer a joiner's `Join` frame.
    pub async fn handle_join_request(&self, info: JoinInfo) -> Frame {
        match self.rejection(&info) {
            Ok(None) => {}
            Ok(Some((field, reason))) => return Frame::JoinRejected { field, reason },
            Err(e) => {
                return Frame::JoinRejected {
                    field: RejectField::Config,
                    reason: e.to_string(),
                };
            }
        }

        if !(self.state.is_master() && self.state.is_joined()) {
            return Frame::NotMaster {
                master: self.state.master().filter(|m| *m != self.state.this_address()),
            };
        }

        let joiner = info.sender;
        let result = self
            .service
            .submit("add joining member", move |registry| {
                registry.add_member(info.sender, info.role, &info.uuid);
                registry.current_members()
            })
            .await;

        match result {
            Ok(members) => {
                info!(%joiner, members = members.len(), "member admitted");
                Frame::JoinAccepted {
                    master: self.state.this_address(),
                    members,
                }
            }
            Err(e) => {
                warn!(%joiner, error = %e, "could not admit member");
                Frame::Retry {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Forget the current cluster and join again.
    pub async fn rejoin(&self) -> JoinResult<()> {
        self.set_phase(JoinPhase::Rejoining);
        info!("rejoining cluster");

        self.state.set_master(None);
        self.state.set_joined(false);
        self.service.submit("reset members", |registry| registry.reset()).await?;
        self.state.clear_failed_connections();

        self.join().await
    }

    fn set_phase(&self, phase: JoinPhase) {
        *self.phase.write() = phase;
    }
}
