use crate::{PermissionError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tether_types::store::keys;
use tether_types::{
    DenialReason, EventBus, GrantId, GrantStatus, KernelEvent, KeyValueStore, PermissionDefinition,
    PermissionGrant, PermissionKind, PermissionScope, PermissionStatus, PluginId, Timestamp,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Waiter = oneshot::Sender<Result<PermissionGrant>>;

#[derive(Default)]
struct PermissionState {
    grants: BTreeMap<PluginId, Vec<PermissionGrant>>,
    /// Completion handles for pending grants. Several requests for the same
    /// tuple share one pending grant.
    waiters: HashMap<GrantId, Vec<Waiter>>,
}

impl PermissionState {
    fn owner_of(&self, id: GrantId) -> Option<PluginId> {
        self.grants
            .iter()
            .find(|(_, table)| table.iter().any(|g| g.id == id))
            .map(|(plugin, _)| plugin.clone())
    }
}

/// A decision the caller still has to wait for, or one that was settled
/// at request time.
#[derive(Debug)]
pub struct PendingPermission {
    grant_id: GrantId,
    state: PendingState,
}

#[derive(Debug)]
enum PendingState {
    Settled(Result<PermissionGrant>),
    Waiting(oneshot::Receiver<Result<PermissionGrant>>),
}

impl PendingPermission {
    fn settled(grant_id: GrantId, outcome: Result<PermissionGrant>) -> Self {
        Self {
            grant_id,
            state: PendingState::Settled(outcome),
        }
    }

    fn waiting(grant_id: GrantId, rx: oneshot::Receiver<Result<PermissionGrant>>) -> Self {
        Self {
            grant_id,
            state: PendingState::Waiting(rx),
        }
    }

    #[must_use]
    pub fn grant_id(&self) -> GrantId {
        self.grant_id
    }

    /// Returns true if an existing decision answered the request.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self.state, PendingState::Settled(_))
    }

    /// Waits for `grant` or `deny`. There is no timeout.
    pub async fn wait(self) -> Result<PermissionGrant> {
        match self.state {
            PendingState::Settled(outcome) => outcome,
            PendingState::Waiting(rx) => rx
                .await
                .unwrap_or_else(|_| Err(PermissionError::Abandoned(self.grant_id))),
        }
    }
}

/// Owns every plugin's grant table.
///
/// Tables are kept in memory and written through to the store under
/// `plugin:<id>:permissions` on every transition. Events are published and
/// waiters completed after the table lock is released.
pub struct PermissionManager {
    state: Mutex<PermissionState>,
    store: Arc<dyn KeyValueStore>,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for PermissionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PermissionManager")
            .field("plugins", &state.grants.len())
            .field("waiting", &state.waiters.len())
            .finish_non_exhaustive()
    }
}

impl PermissionManager {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, events: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(PermissionState::default()),
            store,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PermissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests a permission and waits for the decision.
    pub async fn request(
        &self,
        plugin_id: &PluginId,
        definition: PermissionDefinition,
        reason: Option<String>,
    ) -> Result<PermissionGrant> {
        self.begin_request(plugin_id, definition, reason)?.wait().await
    }

    /// Starts a request without waiting, so the caller learns the grant id.
    ///
    /// The latest stored grant for the identical tuple decides:
    /// - an unexpired GRANTED resolves immediately;
    /// - a DENIED from refusal or revocation rejects immediately;
    /// - a PENDING one gains another waiter;
    /// - an expired or cancelled one is replaced by a new PENDING request.
    pub fn begin_request(
        &self,
        plugin_id: &PluginId,
        definition: PermissionDefinition,
        reason: Option<String>,
    ) -> Result<PendingPermission> {
        let now = Timestamp::now();
        let mut expired = None;

        let (grant, rx, snapshot) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let table = state.grants.entry(plugin_id.clone()).or_default();

            if let Some(i) = table.iter().rposition(|g| g.is_for(&definition)) {
                let existing = &mut table[i];
                if existing.is_expired(now) && existing.mark_withdrawn(DenialReason::Expired) {
                    expired = Some(existing.clone());
                }

                match (existing.status, existing.denial.clone()) {
                    (GrantStatus::Granted, _) => {
                        debug!(plugin_id = %plugin_id, permission = %definition, "Permission already granted");
                        return Ok(PendingPermission::settled(existing.id, Ok(existing.clone())));
                    }
                    (GrantStatus::Pending, _) => {
                        let (tx, rx) = oneshot::channel();
                        state.waiters.entry(existing.id).or_default().push(tx);
                        return Ok(PendingPermission::waiting(existing.id, rx));
                    }
                    (GrantStatus::Denied, Some(reason @ (DenialReason::Refused { .. } | DenialReason::Revoked))) => {
                        debug!(plugin_id = %plugin_id, permission = %definition, "Permission already denied");
                        let err = PermissionError::Denied {
                            grant: existing.id,
                            reason,
                        };
                        return Ok(PendingPermission::settled(existing.id, Err(err)));
                    }
                    (GrantStatus::Denied, _) => {
                        table.remove(i);
                    }
                }
            }

            let grant = PermissionGrant::pending(plugin_id.clone(), definition, reason);
            table.push(grant.clone());
            let snapshot = table.clone();
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(grant.id, vec![tx]);
            (grant, rx, snapshot)
        };

        self.write_through(plugin_id, &snapshot);
        if let Some(grant) = expired {
            self.events.publish(KernelEvent::PermissionExpired { grant });
        }
        info!(
            plugin_id = %plugin_id,
            grant_id = %grant.id,
            permission = %grant.definition,
            "Permission requested"
        );
        let id = grant.id;
        self.events.publish(KernelEvent::PermissionRequested { grant });
        Ok(PendingPermission::waiting(id, rx))
    }

    /// Grants a pending request. Returns false if the id is unknown or the
    /// request was already decided.
    pub fn grant(&self, id: GrantId, expires_in: Option<Duration>) -> Result<bool> {
        let now = Timestamp::now();
        let Some((grant, snapshot, waiters)) = self.decide(id, |g| g.mark_granted(now, expires_in)) else {
            return Ok(false);
        };

        self.write_through(&grant.plugin_id, &snapshot);
        info!(
            plugin_id = %grant.plugin_id,
            grant_id = %id,
            permission = %grant.definition,
            expires_at = ?grant.expires_at,
            "Permission granted"
        );
        self.events.publish(KernelEvent::PermissionGranted {
            grant: grant.clone(),
        });
        for waiter in waiters {
            let _ = waiter.send(Ok(grant.clone()));
        }
        Ok(true)
    }

    /// Denies a pending request. Returns false if the id is unknown or the
    /// request was already decided.
    pub fn deny(&self, id: GrantId, reason: Option<String>) -> Result<bool> {
        let now = Timestamp::now();
        let denial = DenialReason::Refused { reason };
        let Some((grant, snapshot, waiters)) =
            self.decide(id, |g| g.mark_refused(now, denial.clone()))
        else {
            return Ok(false);
        };

        self.write_through(&grant.plugin_id, &snapshot);
        info!(
            plugin_id = %grant.plugin_id,
            grant_id = %id,
            permission = %grant.definition,
            reason = %denial,
            "Permission denied"
        );
        self.events.publish(KernelEvent::PermissionDenied {
            grant: grant.clone(),
        });
        reject_all(waiters, id, &denial);
        Ok(true)
    }

    fn decide(
        &self,
        id: GrantId,
        transition: impl FnOnce(&mut PermissionGrant) -> bool,
    ) -> Option<(PermissionGrant, Vec<PermissionGrant>, Vec<Waiter>)> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let plugin = state.owner_of(id)?;
        let table = state.grants.get_mut(&plugin)?;
        let grant = table.iter_mut().find(|g| g.id == id)?;
        if !transition(grant) {
            debug!(grant_id = %id, status = ?grant.status, "Grant already decided");
            return None;
        }
        let grant = grant.clone();
        let snapshot = table.clone();
        let waiters = state.waiters.remove(&id).unwrap_or_default();
        Some((grant, snapshot, waiters))
    }

    /// Revokes granted permissions for the exact `(kind, scope, target)`.
    /// Returns true if anything was revoked.
    pub fn revoke(
        &self,
        plugin_id: &PluginId,
        kind: &PermissionKind,
        scope: PermissionScope,
        target: Option<&str>,
    ) -> Result<bool> {
        let (revoked, snapshot) = {
            let mut state = self.lock();
            let Some(table) = state.grants.get_mut(plugin_id) else {
                return Ok(false);
            };
            let revoked: Vec<PermissionGrant> = table
                .iter_mut()
                .filter(|g| {
                    g.definition.kind == *kind
                        && g.definition.scope == scope
                        && g.definition.target.as_deref() == target
                })
                .filter_map(|g| g.mark_withdrawn(DenialReason::Revoked).then(|| g.clone()))
                .collect();
            (revoked, table.clone())
        };

        if revoked.is_empty() {
            return Ok(false);
        }
        self.write_through(plugin_id, &snapshot);
        for grant in revoked {
            info!(plugin_id = %plugin_id, grant_id = %grant.id, permission = %grant.definition, "Permission revoked");
            self.events.publish(KernelEvent::PermissionRevoked { grant });
        }
        Ok(true)
    }

    /// Aggregates the decided grants answering `(kind, scope, target)`.
    ///
    /// Matches are grants of the same kind whose scope is equal or `All` and
    /// whose target is equal or `*`. Expired grants are flipped to DENIED on
    /// the way. Pending requests do not count; no match reads as DENIED.
    pub fn check(
        &self,
        plugin_id: &PluginId,
        kind: &PermissionKind,
        scope: PermissionScope,
        target: Option<&str>,
    ) -> Result<PermissionStatus> {
        let now = Timestamp::now();
        let (status, expired, snapshot) = {
            let mut state = self.lock();
            let Some(table) = state.grants.get_mut(plugin_id) else {
                return Ok(PermissionStatus::Denied);
            };

            let mut expired = Vec::new();
            let (mut granted, mut denied) = (0usize, 0usize);
            for grant in table
                .iter_mut()
                .filter(|g| g.status != GrantStatus::Pending && g.definition.answers(kind, scope, target))
            {
                if grant.is_expired(now) && grant.mark_withdrawn(DenialReason::Expired) {
                    expired.push(grant.clone());
                }
                match grant.status {
                    GrantStatus::Granted => granted += 1,
                    _ => denied += 1,
                }
            }

            let status = match (granted, denied) {
                (0, _) => PermissionStatus::Denied,
                (_, 0) => PermissionStatus::Granted,
                _ => PermissionStatus::Partial,
            };
            let snapshot = (!expired.is_empty()).then(|| table.clone());
            (status, expired, snapshot)
        };

        if let Some(snapshot) = snapshot {
            self.write_through(plugin_id, &snapshot);
        }
        for grant in expired {
            debug!(plugin_id = %plugin_id, grant_id = %grant.id, "Permission expired");
            self.events.publish(KernelEvent::PermissionExpired { grant });
        }
        Ok(status)
    }

    /// Rejects every pending request of a plugin. Used on sandbox teardown.
    pub fn cancel_pending(&self, plugin_id: &PluginId) -> Result<usize> {
        let now = Timestamp::now();
        let (cancelled, waiters, snapshot) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(table) = state.grants.get_mut(plugin_id) else {
                return Ok(0);
            };
            let cancelled: Vec<PermissionGrant> = table
                .iter_mut()
                .filter_map(|g| g.mark_refused(now, DenialReason::Cancelled).then(|| g.clone()))
                .collect();
            let waiters: Vec<(GrantId, Vec<Waiter>)> = cancelled
                .iter()
                .filter_map(|g| state.waiters.remove(&g.id).map(|w| (g.id, w)))
                .collect();
            (cancelled, waiters, table.clone())
        };

        if cancelled.is_empty() {
            return Ok(0);
        }
        self.write_through(plugin_id, &snapshot);
        info!(plugin_id = %plugin_id, count = cancelled.len(), "Pending permission requests cancelled");
        let count = cancelled.len();
        for grant in cancelled {
            self.events.publish(KernelEvent::PermissionDenied { grant });
        }
        for (id, group) in waiters {
            reject_all(group, id, &DenialReason::Cancelled);
        }
        Ok(count)
    }

    /// Hydrates a plugin's grant table from the store. No-op if the table
    /// is already in memory. Returns the number of grants held.
    pub fn load_plugin(&self, plugin_id: &PluginId) -> Result<usize> {
        if let Some(table) = self.lock().grants.get(plugin_id) {
            return Ok(table.len());
        }

        let stored: Vec<PermissionGrant> = match self.store.get(&keys::permissions(plugin_id))? {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };
        let count = stored.len();
        self.lock().grants.entry(plugin_id.clone()).or_insert(stored);
        debug!(plugin_id = %plugin_id, count, "Grant table loaded");
        Ok(count)
    }

    /// Drops every trace of a plugin's grants, rejecting pending requests.
    pub fn forget_plugin(&self, plugin_id: &PluginId) -> Result<()> {
        self.cancel_pending(plugin_id)?;
        self.lock().grants.remove(plugin_id);
        self.store.remove(&keys::permissions(plugin_id))?;
        debug!(plugin_id = %plugin_id, "Grant table removed");
        Ok(())
    }

    #[must_use]
    pub fn grants_for(&self, plugin_id: &PluginId) -> Vec<PermissionGrant> {
        self.lock().grants.get(plugin_id).cloned().unwrap_or_default()
    }

    /// All undecided requests, for a consent UI that starts late.
    #[must_use]
    pub fn pending(&self) -> Vec<PermissionGrant> {
        self.lock()
            .grants
            .values()
            .flatten()
            .filter(|g| g.status == GrantStatus::Pending)
            .cloned()
            .collect()
    }

    /// Writes a table snapshot to the store. The in-memory table has
    /// already changed and stays authoritative; a failed write is logged and
    /// the next transition writes the whole table again.
    fn write_through(&self, plugin_id: &PluginId, table: &[PermissionGrant]) {
        let written = serde_json::to_value(table)
            .map_err(PermissionError::from)
            .and_then(|value| {
                self.store
                    .set(&keys::permissions(plugin_id), value)
                    .map_err(PermissionError::from)
            });
        if let Err(e) = written {
            warn!(plugin_id = %plugin_id, error = %e, "Failed to persist grant table");
        }
    }
}

fn reject_all(waiters: Vec<Waiter>, grant: GrantId, reason: &DenialReason) {
    for waiter in waiters {
        let _ = waiter.send(Err(PermissionError::Denied {
            grant,
            reason: reason.clone(),
        }));
    }
}
