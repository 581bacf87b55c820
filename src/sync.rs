//! Host/guest replication of the navigation position.
//!
//! The host publishes its position after every move; guests follow it with
//! their own navigation locked. The realtime channel is the primary path, and
//! the HTTP endpoints remain authoritative for status and the current state.

use crate::api::{RemoteState, ServerApi, SyncMedia, SyncStatus, SyncUpdate};
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::media::MediaItem;
use crate::navigation::NavigationController;
use crate::realtime::{ChannelLink, ClientMessage, SyncEvent};
use async_trait::async_trait;
use std::sync::Arc;

/// Request/response side of the sync protocol.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn status(&self) -> Result<SyncStatus>;

    async fn toggle(&self, enabled: bool, media: Option<SyncMedia>) -> Result<SyncStatus>;

    async fn send_update(&self, update: &SyncUpdate) -> Result<()>;

    /// Current host state, `None` when sync mode is off.
    async fn current(&self) -> Result<Option<RemoteState>>;
}

#[async_trait]
impl SyncTransport for ServerApi {
    async fn status(&self) -> Result<SyncStatus> {
        self.sync_status().await
    }

    async fn toggle(&self, enabled: bool, media: Option<SyncMedia>) -> Result<SyncStatus> {
        self.sync_toggle(enabled, media.as_ref()).await
    }

    async fn send_update(&self, update: &SyncUpdate) -> Result<()> {
        self.sync_update(update).await
    }

    async fn current(&self) -> Result<Option<RemoteState>> {
        self.sync_current().await
    }
}

/// One order is a prefix of the other: both sides only loaded different
/// amounts of the same sequence.
fn orders_agree(order: &[String], items: &[MediaItem]) -> bool {
    order
        .iter()
        .zip(items)
        .all(|(url, item)| *url == item.url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncRole {
    #[default]
    None,
    Host,
    Guest,
}

/// Per-process sync bookkeeping. Survives category changes.
#[derive(Debug, Clone, Default)]
pub struct SyncSession {
    pub enabled: bool,
    pub role: SyncRole,
    pub last_emitted_category: Option<String>,
    pub last_emitted_index: Option<usize>,
    pub last_emitted_order_hash: Option<String>,
    pub emission_count: u64,
    pub reconnect_attempt: u32,
}

pub struct SyncCoordinator {
    transport: Arc<dyn SyncTransport>,
    session_id: String,
    settings: SyncSettings,
    session: SyncSession,
    channel: Option<ChannelLink>,
    connected: bool,
}

impl SyncCoordinator {
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        session_id: impl Into<String>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            transport,
            session_id: session_id.into(),
            settings,
            session: SyncSession::default(),
            channel: None,
            connected: false,
        }
    }

    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    pub fn role(&self) -> SyncRole {
        self.session.role
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn attach_channel(&mut self, link: ChannelLink) {
        self.channel = Some(link);
    }

    fn send(&self, message: ClientMessage) {
        if let Some(channel) = &self.channel {
            channel.send(message);
        }
    }

    /// Turn sync on with this client as host, starting at the current item.
    pub async fn enable(&mut self, nav: &mut NavigationController) -> Result<SyncRole> {
        let media = nav.current_item().map(|item| SyncMedia {
            category_id: nav.category_id().map(str::to_owned),
            file_url: Some(item.url.clone()),
            index: nav.current_index(),
        });
        let status = self.transport.toggle(true, media).await?;
        let role = self.adopt(status, None, nav).await?;
        if role == SyncRole::Host {
            self.publish_now(nav).await?;
        }
        Ok(role)
    }

    /// Leave sync. A host turns it off for everyone.
    pub async fn disable(&mut self, nav: &mut NavigationController) -> Result<()> {
        match self.session.role {
            SyncRole::Host => {
                self.transport.toggle(false, None).await?;
            }
            SyncRole::Guest => self.send(ClientMessage::LeaveSync),
            SyncRole::None => {}
        }
        tracing::info!("Sync mode disabled");
        self.reset_local(nav);
        Ok(())
    }

    /// Ask the server which role this client has and apply it.
    pub async fn refresh_status(&mut self, nav: &mut NavigationController) -> Result<SyncRole> {
        let status = self.transport.status().await?;
        self.adopt(status, None, nav).await
    }

    async fn adopt(
        &mut self,
        status: SyncStatus,
        initial: Option<RemoteState>,
        nav: &mut NavigationController,
    ) -> Result<SyncRole> {
        let role = match (status.active, status.is_host) {
            (false, _) => SyncRole::None,
            (true, true) => SyncRole::Host,
            (true, false) => SyncRole::Guest,
        };
        let previous = self.session.role;

        match role {
            SyncRole::None => {
                if previous != SyncRole::None {
                    tracing::info!("Sync mode is no longer active");
                }
                self.reset_local(nav);
            }
            SyncRole::Host => {
                if previous != SyncRole::Host {
                    tracing::info!("Sync mode active, hosting");
                    self.session = SyncSession::default();
                }
                self.session.enabled = true;
                self.session.role = SyncRole::Host;
                nav.set_locked(false);
                nav.set_host(true);
                nav.set_sync_ordering(true);
            }
            SyncRole::Guest => {
                self.session.enabled = true;
                self.session.role = SyncRole::Guest;
                nav.set_host(false);
                nav.set_locked(true);
                nav.set_sync_ordering(true);
                if previous != SyncRole::Guest {
                    tracing::info!("Sync mode active, following host");
                    self.send(ClientMessage::JoinSync);
                    let state = match initial {
                        Some(state) => Some(state),
                        None => self.transport.current().await?,
                    };
                    if let Some(state) = state {
                        if let Err(e) = self.apply_remote(nav, state).await {
                            tracing::warn!("Failed to follow host: {}", e);
                        }
                    }
                }
            }
        }
        Ok(role)
    }

    fn reset_local(&mut self, nav: &mut NavigationController) {
        self.session = SyncSession::default();
        nav.set_host(false);
        nav.set_locked(false);
        nav.set_sync_ordering(false);
    }

    /// Publish the latest recorded move, if hosting.
    pub async fn publish(&mut self, nav: &mut NavigationController) -> Result<bool> {
        let changes = nav.take_position_changes();
        if self.session.role != SyncRole::Host || changes.is_empty() {
            return Ok(false);
        }
        self.publish_now(nav).await
    }

    async fn publish_now(&mut self, nav: &NavigationController) -> Result<bool> {
        let Some(update) = self.build_update(nav) else {
            return Ok(false);
        };
        tracing::debug!(
            "Publishing {} index {} (order included: {})",
            update.category_id,
            update.index,
            update.media_order.is_some()
        );
        if let Err(e) = self.transport.send_update(&update).await {
            tracing::warn!("Sync update failed: {}", e);
            return Err(e);
        }
        if self.connected {
            self.send(ClientMessage::UpdateMyState {
                category_id: update.category_id.clone(),
                index: update.index,
                media_order: nav.list().urls(),
            });
        }

        if update.media_order.is_some() {
            self.session.last_emitted_order_hash = Some(nav.list().fingerprint());
        }
        self.session.last_emitted_category = Some(update.category_id);
        self.session.last_emitted_index = Some(update.index);
        self.session.emission_count += 1;
        Ok(true)
    }

    /// The update a host would send for the current position.
    ///
    /// The full order rides along when the category or the order changed
    /// since the last emission, and on every Nth emission regardless.
    pub fn build_update(&self, nav: &NavigationController) -> Option<SyncUpdate> {
        let category_id = nav.category_id()?.to_string();
        let item = nav.current_item()?;
        let fingerprint = nav.list().fingerprint();

        let category_changed =
            self.session.last_emitted_category.as_deref() != Some(category_id.as_str());
        let order_changed =
            self.session.last_emitted_order_hash.as_deref() != Some(fingerprint.as_str());
        let every = self.settings.order_resync_every.max(1);
        let periodic = (self.session.emission_count + 1) % every == 0;

        Some(SyncUpdate {
            category_id,
            file_url: Some(item.url.clone()),
            index: nav.current_index(),
            media_order: (category_changed || order_changed || periodic)
                .then(|| nav.list().urls()),
        })
    }

    /// Follow a host state. Returns whether navigation changed.
    pub async fn apply_remote(
        &mut self,
        nav: &mut NavigationController,
        state: RemoteState,
    ) -> Result<bool> {
        if self.session.role != SyncRole::Guest {
            tracing::debug!("Ignoring remote state, not a guest");
            return Ok(false);
        }
        let Some(category_id) = state.category_id.as_deref() else {
            return Ok(false);
        };
        let order = state.media_order.clone().filter(|order| !order.is_empty());

        if nav.category_id() != Some(category_id) {
            tracing::info!("Host moved to category {} index {}", category_id, state.index);
            nav.enter_category(category_id, order, state.index).await?;
            return Ok(true);
        }
        if let Some(order) = order {
            if !orders_agree(&order, nav.list().items()) {
                tracing::info!("Host order changed, reloading {}", category_id);
                nav.enter_category(category_id, Some(order), state.index).await?;
                return Ok(true);
            }
        }
        if state.index != nav.current_index() {
            nav.jump_to(state.index).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// React to a channel event.
    pub async fn handle_event(
        &mut self,
        nav: &mut NavigationController,
        event: SyncEvent,
    ) -> Result<()> {
        match event {
            SyncEvent::Connected => {
                self.connected = true;
                self.session.reconnect_attempt = 0;
            }
            SyncEvent::Reconnecting { attempt, .. } => {
                self.connected = false;
                self.session.reconnect_attempt = attempt;
            }
            SyncEvent::Disconnected { server_initiated } => {
                self.connected = false;
                if server_initiated {
                    let role = self.refresh_status(nav).await?;
                    if role != SyncRole::None {
                        if let Some(channel) = &self.channel {
                            channel.resume();
                        }
                    }
                }
            }
            SyncEvent::Exhausted { attempts } => {
                self.connected = false;
                self.channel = None;
                let was_enabled = self.session.enabled;
                self.reset_local(nav);
                if was_enabled {
                    tracing::error!("Sync unavailable, disabled locally");
                }
                return Err(Error::SyncUnavailable(format!(
                    "sync channel gave up after {} reconnect attempts",
                    attempts
                )));
            }
            SyncEvent::Enabled {
                host_session_id,
                media,
            } => {
                let is_host = host_session_id.as_deref() == Some(self.session_id.as_str());
                let status = SyncStatus {
                    active: true,
                    is_host,
                };
                self.adopt(status, media, nav).await?;
            }
            SyncEvent::State(state) => {
                self.apply_remote(nav, state).await?;
            }
            SyncEvent::Disabled => {
                if self.session.enabled {
                    tracing::info!("Host ended sync mode");
                }
                self.reset_local(nav);
            }
            SyncEvent::Error { message } => {
                tracing::warn!("Sync error from server: {}", message);
            }
            SyncEvent::HeartbeatAck => {}
        }
        Ok(())
    }

    /// HTTP fallback for guests when the channel is down.
    pub async fn poll_current(&mut self, nav: &mut NavigationController) -> Result<bool> {
        if self.session.role != SyncRole::Guest {
            return Ok(false);
        }
        match self.transport.current().await? {
            Some(state) => self.apply_remote(nav, state).await,
            None => {
                tracing::info!("Sync mode ended while polling");
                self.reset_local(nav);
                Ok(false)
            }
        }
    }
}
