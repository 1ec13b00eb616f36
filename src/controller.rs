//! Reconciliation controller.
//!
//! Keeps the in-memory selection, the URL query and the persisted cache in
//! agreement and drives the fetch orchestrator from selection changes.
//! Initial resolution order is URL (validated against the reference list),
//! then cache, then unresolved. Every selection change flows through one
//! store subscription: cache first, then URL, then the fetch decision.

use crate::cache::PersistedCache;
use crate::errors::{ConfigError, FetchError};
use crate::models::{Entity, FetchMode, FieldSpec, FieldValue, WEBSITE_FIELD};
use crate::notify::Subscription;
use crate::orchestrator::{FetchOrchestrator, KeySnapshot, RequestOptions, DEFAULT_DEBOUNCE};
use crate::selection::{Selection, SelectionChange, SelectionStore};
use crate::url_state::{Location, Params, UrlState, WriteMode};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const SELECTED_ENTITY_KEY: &str = "selected-website";
pub const REFERENCE_LIST_KEY: &str = "websites";
pub const DEFAULT_SELECTION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_REFERENCE_TTL: Duration = Duration::from_secs(60 * 60);

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, FetchError>> + Send>>;
type Producer<T> = Arc<dyn Fn(FetchRequest) -> BoxFuture<T> + Send + Sync>;
type ReferenceLoader = Arc<dyn Fn() -> BoxFuture<Vec<Entity>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    Resolving,
    Ready,
    Refetching,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceState {
    Pending,
    Loaded(Arc<Vec<Entity>>),
    Failed(FetchError),
}

/// What a producer receives: the query key, the fingerprint it is keyed on,
/// and the selection snapshot the fingerprint was computed from.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub key: String,
    pub fingerprint: String,
    pub selection: Selection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeOrigin {
    User(WriteMode),
    Resolution,
    PopState,
}

impl ChangeOrigin {
    const USER_EDIT: Self = Self::User(WriteMode::Replace);
}

pub struct ControllerBuilder<T> {
    fields: Vec<FieldSpec>,
    entity_field: String,
    queries: Vec<(String, Producer<T>)>,
    loader: Option<ReferenceLoader>,
    location: Option<Arc<dyn Location>>,
    cache: Option<PersistedCache>,
    debounce: Duration,
    selection_ttl: Duration,
    reference_ttl: Duration,
}

impl<T: Send + Sync + 'static> Default for ControllerBuilder<T> {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            entity_field: WEBSITE_FIELD.to_owned(),
            queries: Vec::new(),
            loader: None,
            location: None,
            cache: None,
            debounce: DEFAULT_DEBOUNCE,
            selection_ttl: DEFAULT_SELECTION_TTL,
            reference_ttl: DEFAULT_REFERENCE_TTL,
        }
    }
}

impl<T: Send + Sync + 'static> ControllerBuilder<T> {
    pub fn fields(mut self, fields: impl IntoIterator<Item = FieldSpec>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn entity_field(mut self, name: impl Into<String>) -> Self {
        self.entity_field = name.into();
        self
    }

    /// Registers a query fetched on every trigger under its own orchestrator key.
    pub fn query<F, Fut>(mut self, key: impl Into<String>, producer: F) -> Self
    where
        F: Fn(FetchRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let producer: Producer<T> =
            Arc::new(move |request: FetchRequest| -> BoxFuture<T> { Box::pin(producer(request)) });
        self.queries.push((key.into(), producer));
        self
    }

    pub fn reference_loader<F, Fut>(mut self, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Entity>, FetchError>> + Send + 'static,
    {
        self.loader = Some(Arc::new(move || -> BoxFuture<Vec<Entity>> { Box::pin(loader()) }));
        self
    }

    pub fn location(mut self, location: Arc<dyn Location>) -> Self {
        self.location = Some(location);
        self
    }

    pub fn cache(mut self, cache: PersistedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    pub fn selection_ttl(mut self, ttl: Duration) -> Self {
        self.selection_ttl = ttl;
        self
    }

    pub fn reference_ttl(mut self, ttl: Duration) -> Self {
        self.reference_ttl = ttl;
        self
    }

    pub fn build(self) -> Result<DashboardController<T>, ConfigError> {
        let entity = self
            .fields
            .iter()
            .find(|spec| spec.name == self.entity_field)
            .cloned()
            .ok_or_else(|| {
                ConfigError::controller(format!("entity field '{}' is not declared", self.entity_field))
            })?;
        if !matches!(entity.default, FieldValue::Text(_)) {
            return Err(ConfigError::controller("entity field must hold text"));
        }
        if self.queries.is_empty() {
            return Err(ConfigError::controller("at least one query is required"));
        }
        let mut params = BTreeSet::new();
        let mut names = BTreeSet::new();
        for spec in &self.fields {
            if !names.insert(spec.name.as_str()) {
                return Err(ConfigError::controller(format!("field '{}' declared twice", spec.name)));
            }
            if spec.shareable && !params.insert(spec.param.as_str()) {
                return Err(ConfigError::controller(format!("url param '{}' used twice", spec.param)));
            }
        }
        let loader = self
            .loader
            .ok_or_else(|| ConfigError::controller("a reference loader is required"))?;
        let location = self
            .location
            .ok_or_else(|| ConfigError::controller("a location is required"))?;
        let cache = self
            .cache
            .ok_or_else(|| ConfigError::controller("a persisted cache is required"))?;

        let url = UrlState::new(location, params.iter().map(|p| p.to_string()));
        let store = SelectionStore::new(&self.fields);
        let (phase, _) = watch::channel(Phase::Uninitialized);
        let (references, _) = watch::channel(ReferenceState::Pending);

        Ok(DashboardController {
            inner: Arc::new(Inner {
                fields: self.fields,
                entity,
                queries: self.queries,
                loader,
                store,
                url,
                cache,
                orchestrator: FetchOrchestrator::new(self.debounce),
                selection_ttl: self.selection_ttl,
                reference_ttl: self.reference_ttl,
                phase,
                references,
                sync: Mutex::new(SyncState {
                    origin: ChangeOrigin::USER_EDIT,
                    pending_url_entity: None,
                    user_picked_entity: false,
                    validation_error: None,
                    loader_task: None,
                    subscriptions: Vec::new(),
                    shut_down: false,
                }),
            }),
        })
    }
}

struct SyncState {
    /// Origin of the store change currently being applied.
    origin: ChangeOrigin,
    /// URL entity waiting for the reference list; consumed exactly once.
    pending_url_entity: Option<String>,
    user_picked_entity: bool,
    validation_error: Option<FetchError>,
    loader_task: Option<JoinHandle<()>>,
    subscriptions: Vec<Subscription>,
    shut_down: bool,
}

struct Inner<T> {
    fields: Vec<FieldSpec>,
    entity: FieldSpec,
    queries: Vec<(String, Producer<T>)>,
    loader: ReferenceLoader,
    store: SelectionStore,
    url: UrlState,
    cache: PersistedCache,
    orchestrator: FetchOrchestrator<T>,
    selection_ttl: Duration,
    reference_ttl: Duration,
    phase: watch::Sender<Phase>,
    references: watch::Sender<ReferenceState>,
    sync: Mutex<SyncState>,
}

/// One dashboard page's selection/fetch controller.
pub struct DashboardController<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DashboardController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> DashboardController<T> {
    pub fn builder() -> ControllerBuilder<T> {
        ControllerBuilder::default()
    }

    /// Wires subscriptions, starts the reference list and resolves the
    /// starting selection. Must run inside a current-thread Tokio runtime;
    /// user calls and the loader task are not serialized otherwise.
    pub fn mount(&self) {
        let inner = &self.inner;
        if *inner.phase.borrow() != Phase::Uninitialized {
            warn!("controller already mounted");
            return;
        }
        inner.set_phase(Phase::Resolving);

        let weak = Arc::downgrade(inner);
        let subscriptions = vec![
            inner.store.subscribe({
                let weak = weak.clone();
                move |change: &SelectionChange| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_selection_changed(change);
                    }
                }
            }),
            inner.url.on_pop_state({
                let weak = weak.clone();
                move |params: Params| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_pop_state(params);
                    }
                }
            }),
            inner.orchestrator.on_settled(move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_fetch_settled(event.key());
                }
            }),
        ];
        inner.sync.lock().subscriptions = subscriptions;

        inner.load_references();
        inner.resolve();
        inner.finish_resolving();
    }

    /// User edit; the URL is rewritten in place.
    pub fn set(&self, field: &str, value: FieldValue) -> bool {
        self.inner
            .user_edit(vec![(field.to_owned(), value)], WriteMode::Replace)
    }

    /// User edit that adds a history entry.
    pub fn navigate(&self, field: &str, value: FieldValue) -> bool {
        self.inner
            .user_edit(vec![(field.to_owned(), value)], WriteMode::Push)
    }

    /// Applies several fields at once (e.g. a shared preset).
    pub fn update<I>(&self, updates: I) -> bool
    where
        I: IntoIterator<Item = (String, FieldValue)>,
    {
        self.inner
            .user_edit(updates.into_iter().collect(), WriteMode::Replace)
    }

    /// Fetches pending manual-apply changes.
    pub fn apply(&self) -> bool {
        self.inner.fetch(false)
    }

    pub fn retry(&self) -> bool {
        self.inner.fetch(true)
    }

    /// Re-runs initial resolution from the URL and the cache.
    pub fn reset(&self) {
        {
            let mut sync = self.inner.sync.lock();
            sync.user_picked_entity = false;
            sync.pending_url_entity = None;
            sync.validation_error = None;
        }
        self.inner.set_phase(Phase::Resolving);
        self.inner.resolve();
        self.inner.finish_resolving();
    }

    /// Drops the remembered website; the current selection is kept.
    pub fn forget(&self) {
        info!("forgetting cached website");
        self.inner.cache.clear(SELECTED_ENTITY_KEY);
    }

    pub fn invalidate_references(&self) {
        info!("reference list invalidated");
        self.inner.cache.clear(REFERENCE_LIST_KEY);
        self.inner.load_references();
    }

    pub fn selection(&self) -> Selection {
        self.inner.store.snapshot()
    }

    pub fn fingerprint(&self) -> String {
        self.inner.store.fingerprint()
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<Phase> {
        self.inner.phase.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.orchestrator.is_loading()
    }

    pub fn loading_receiver(&self) -> watch::Receiver<bool> {
        self.inner.orchestrator.loading_receiver()
    }

    pub fn orchestrator(&self) -> &FetchOrchestrator<T> {
        &self.inner.orchestrator
    }

    pub fn data(&self, key: &str) -> Option<Arc<T>> {
        self.inner.orchestrator.data(key)
    }

    pub fn snapshot(&self, key: &str) -> KeySnapshot<T> {
        self.inner.orchestrator.snapshot(key)
    }

    /// First user-visible error: validation, reference list, then queries.
    pub fn error(&self) -> Option<FetchError> {
        if let Some(error) = self.inner.sync.lock().validation_error.clone() {
            return Some(error);
        }
        if let ReferenceState::Failed(error) = &*self.inner.references.borrow() {
            return Some(error.clone());
        }
        self.inner
            .queries
            .iter()
            .find_map(|(key, _)| {
                self.inner
                    .orchestrator
                    .error(key)
                    .filter(FetchError::is_user_visible)
            })
    }

    /// True when the selection differs from what was last fetched or is
    /// being fetched for the primary query.
    pub fn has_unapplied_changes(&self) -> bool {
        let selection = self.inner.store.snapshot();
        if !self.inner.entity_resolved(&selection) {
            return false;
        }
        let fingerprint = selection.fingerprint();
        let Some((primary, _)) = self.inner.queries.first() else {
            return false;
        };
        let snapshot = self.inner.orchestrator.snapshot(primary);
        snapshot.in_flight.as_deref() != Some(fingerprint.as_str())
            && snapshot.applied_fingerprint.as_deref() != Some(fingerprint.as_str())
    }

    pub fn references(&self) -> Option<Arc<Vec<Entity>>> {
        self.inner.loaded_references()
    }

    pub fn reference_state(&self) -> ReferenceState {
        self.inner.references.borrow().clone()
    }

    /// Waits until the reference list is loaded or has failed.
    pub async fn references_settled(&self) -> ReferenceState {
        let mut receiver = self.inner.references.subscribe();
        match receiver
            .wait_for(|state| !matches!(state, ReferenceState::Pending))
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => ReferenceState::Pending,
        }
    }

    pub async fn idle(&self) {
        self.inner.orchestrator.idle().await;
    }

    pub fn shutdown(&self) {
        let (task, subscriptions) = {
            let mut sync = self.inner.sync.lock();
            sync.shut_down = true;
            (
                sync.loader_task.take(),
                std::mem::take(&mut sync.subscriptions),
            )
        };
        if let Some(task) = task {
            task.abort();
        }
        drop(subscriptions);
        self.inner.orchestrator.shutdown();
        info!("dashboard controller shut down");
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    fn set_phase(&self, next: Phase) {
        self.phase.send_if_modified(|phase| {
            if *phase == next {
                return false;
            }
            debug!(from = ?*phase, to = ?next, "controller phase");
            *phase = next;
            true
        });
    }

    fn finish_resolving(&self) {
        self.set_phase(Phase::Ready);
        if self.orchestrator.has_in_flight() {
            self.set_phase(Phase::Refetching);
        }
    }

    fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|spec| spec.name == name)
    }

    fn entity_resolved(&self, selection: &Selection) -> bool {
        selection
            .text(&self.entity.name)
            .is_some_and(|id| !id.is_empty())
    }

    fn loaded_references(&self) -> Option<Arc<Vec<Entity>>> {
        match &*self.references.borrow() {
            ReferenceState::Loaded(list) => Some(Arc::clone(list)),
            _ => None,
        }
    }

    /// Runs a store mutation tagged with its origin so the change handler
    /// knows which side effects apply.
    fn with_origin<R>(&self, origin: ChangeOrigin, apply: impl FnOnce(&SelectionStore) -> R) -> R {
        self.sync.lock().origin = origin;
        let result = apply(&self.store);
        self.sync.lock().origin = ChangeOrigin::USER_EDIT;
        result
    }

    fn user_edit(&self, updates: Vec<(String, FieldValue)>, mode: WriteMode) -> bool {
        if updates.iter().any(|(field, _)| *field == self.entity.name) {
            let mut sync = self.sync.lock();
            sync.user_picked_entity = true;
            sync.validation_error = None;
        }
        self.with_origin(ChangeOrigin::User(mode), |store| store.set_many(updates))
    }

    fn load_references(self: &Arc<Self>) {
        if let Some(list) = self
            .cache
            .get::<Vec<Entity>>(REFERENCE_LIST_KEY, self.reference_ttl)
        {
            debug!(count = list.len(), "reference list restored from cache");
            self.references
                .send_replace(ReferenceState::Loaded(Arc::new(list)));
            return;
        }

        self.references.send_replace(ReferenceState::Pending);
        let loader = Arc::clone(&self.loader);
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let result = loader().await;
            if let Some(inner) = weak.upgrade() {
                inner.on_references_loaded(result);
            }
        });
        if let Some(previous) = self.sync.lock().loader_task.replace(task) {
            previous.abort();
        }
    }

    fn on_references_loaded(&self, result: Result<Vec<Entity>, FetchError>) {
        if self.sync.lock().shut_down {
            return;
        }
        let list = match result {
            Ok(list) => Arc::new(list),
            Err(error) => {
                warn!(%error, "reference list failed to load");
                self.references.send_replace(ReferenceState::Failed(error));
                return;
            }
        };
        info!(count = list.len(), "reference list loaded");
        self.cache.set(REFERENCE_LIST_KEY, &*list);

        let pending = {
            let mut sync = self.sync.lock();
            let pending = sync.pending_url_entity.take();
            if sync.user_picked_entity {
                if let Some(id) = &pending {
                    info!(url = %id, "keeping manual website choice over url value");
                }
                None
            } else {
                pending
            }
        };

        if let Some(id) = pending {
            if contains(&list, &id) {
                info!(website = %id, "resolved website from url");
                self.with_origin(ChangeOrigin::Resolution, |store| {
                    store.set(&self.entity.name, FieldValue::Text(id))
                });
            } else {
                self.reject_entity(&id);
                self.write_url(&self.store.snapshot(), WriteMode::Replace, false);
            }
        }
        self.drop_unknown_entity(&list);

        // waiters see the selection the list produced
        self.references.send_replace(ReferenceState::Loaded(list));
    }

    /// A website adopted from cache before the list arrived may no longer exist.
    fn drop_unknown_entity(&self, list: &[Entity]) {
        if self.sync.lock().user_picked_entity {
            return;
        }
        let current = self.store.snapshot();
        let Some(id) = current.text(&self.entity.name).filter(|id| !id.is_empty()) else {
            return;
        };
        if contains(list, id) {
            return;
        }
        info!(website = %id, "cached website is no longer available");
        self.cache.clear(SELECTED_ENTITY_KEY);
        self.with_origin(ChangeOrigin::Resolution, |store| {
            store.set(&self.entity.name, self.entity.default.clone())
        });
    }

    fn reject_entity(&self, id: &str) {
        let error = FetchError::ValidationFailure(id.to_owned());
        warn!(%error, "url website rejected");
        self.sync.lock().validation_error = Some(error);
    }

    fn cached_entity(&self, references: Option<&[Entity]>) -> Option<String> {
        let id: String = self.cache.get(SELECTED_ENTITY_KEY, self.selection_ttl)?;
        match references {
            Some(list) if !contains(list, &id) => {
                info!(website = %id, "forgetting cached website missing from reference list");
                self.cache.clear(SELECTED_ENTITY_KEY);
                None
            }
            _ => Some(id).filter(|id| !id.is_empty()),
        }
    }

    fn resolve(&self) {
        let params = self.url.snapshot();
        let references = self.loaded_references();

        let mut resolved = self.store.defaults().clone();
        for spec in self
            .fields
            .iter()
            .filter(|spec| spec.shareable && spec.name != self.entity.name)
        {
            resolved.insert(spec.name.clone(), spec.value_from_params(params.get(&spec.param)));
        }

        let url_entity = params
            .get(&self.entity.param)
            .and_then(|values| values.first())
            .filter(|id| !id.is_empty())
            .cloned();

        let mut entity = None;
        match (url_entity, references.as_deref()) {
            (Some(id), Some(list)) if contains(list, &id) => entity = Some(id),
            (Some(id), Some(_)) => self.reject_entity(&id),
            (Some(id), None) => {
                debug!(website = %id, "url website waits for the reference list");
                self.sync.lock().pending_url_entity = Some(id);
            }
            (None, _) => {}
        }

        let entity = entity.or_else(|| self.cached_entity(references.as_deref().map(Vec::as_slice)));
        match &entity {
            Some(id) => {
                info!(website = %id, "resolved starting selection");
                resolved.insert(self.entity.name.clone(), FieldValue::Text(id.clone()));
            }
            None => debug!("no website resolved yet"),
        }

        self.with_origin(ChangeOrigin::Resolution, |store| store.replace(&resolved));
    }

    fn on_selection_changed(&self, change: &SelectionChange) {
        let (origin, pending_url_entity) = {
            let mut sync = self.sync.lock();
            (
                std::mem::replace(&mut sync.origin, ChangeOrigin::USER_EDIT),
                sync.pending_url_entity.is_some(),
            )
        };
        debug!(?origin, changed = ?change.changed, "selection changed");

        if change.touches(&self.entity.name) {
            match change
                .selection
                .text(&self.entity.name)
                .filter(|id| !id.is_empty())
            {
                Some(id) => self.cache.set(SELECTED_ENTITY_KEY, &id),
                None => self.cache.clear(SELECTED_ENTITY_KEY),
            }
        }

        match origin {
            ChangeOrigin::PopState => {}
            ChangeOrigin::Resolution => {
                // the url website still waiting on the list stays on the url
                self.write_url(&change.selection, WriteMode::Replace, pending_url_entity);
            }
            ChangeOrigin::User(mode) => {
                let keep_entity_param =
                    pending_url_entity && !change.touches(&self.entity.name);
                self.write_url(&change.selection, mode, keep_entity_param);
            }
        }

        // history traversal is gated like the edit it undoes
        let refetch = match origin {
            ChangeOrigin::User(_) | ChangeOrigin::PopState => change.changed.iter().any(|name| {
                self.field(name)
                    .is_some_and(|spec| spec.fetch == FetchMode::Auto)
            }),
            ChangeOrigin::Resolution => true,
        };
        if refetch {
            self.fetch(false);
        } else {
            debug!("manual-apply change pending");
        }
    }

    fn write_url(&self, selection: &Selection, mode: WriteMode, keep_entity_param: bool) {
        let params: Params = self
            .fields
            .iter()
            .filter(|spec| spec.shareable)
            .filter(|spec| !(keep_entity_param && spec.name == self.entity.name))
            .map(|spec| {
                let value = selection.get(&spec.name).unwrap_or(&spec.default);
                (spec.param.clone(), spec.params_for(value))
            })
            .collect();
        self.url.write(&params, mode);
    }

    fn on_pop_state(&self, params: Params) {
        let restored: Selection = self
            .fields
            .iter()
            .filter(|spec| spec.shareable)
            .map(|spec| (spec.name.clone(), spec.value_from_params(params.get(&spec.param))))
            .collect();
        let updates: Vec<(String, FieldValue)> = restored
            .diff(&self.store.snapshot())
            .into_iter()
            .filter_map(|name| {
                let value = restored.get(&name).cloned()?;
                Some((name, value))
            })
            .collect();
        if updates.is_empty() {
            debug!("history entry matches current selection");
            return;
        }

        info!(
            fields = ?updates.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
            "restoring selection from history"
        );
        self.with_origin(ChangeOrigin::PopState, |store| store.set_many(updates));
    }

    fn fetch(&self, force: bool) -> bool {
        let selection = self.store.snapshot();
        if !self.entity_resolved(&selection) {
            debug!("no website selected; skipping fetch");
            return false;
        }

        let fingerprint = selection.fingerprint();
        let options = RequestOptions { force };
        let mut issued = false;
        for (key, producer) in &self.queries {
            let request = FetchRequest {
                key: key.clone(),
                fingerprint: fingerprint.clone(),
                selection: selection.clone(),
            };
            let producer = Arc::clone(producer);
            issued |= self
                .orchestrator
                .request(key, &fingerprint, move |_| producer(request), options);
        }

        if self.orchestrator.has_in_flight() && *self.phase.borrow() == Phase::Ready {
            self.set_phase(Phase::Refetching);
        }
        issued
    }

    fn on_fetch_settled(&self, key: &str) {
        debug!(%key, "fetch settled");
        if !self.orchestrator.has_in_flight() && *self.phase.borrow() == Phase::Refetching {
            self.set_phase(Phase::Ready);
        }
    }
}

fn contains(list: &[Entity], id: &str) -> bool {
    list.iter().any(|entity| entity.id == id)
}
