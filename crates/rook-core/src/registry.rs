//! Extension registry.
//!
//! Each load produces a versioned [`ExtensionHandle`] that owns the commands,
//! listeners, error routes, task handlers and converters the extension
//! registered. Setup writes into a staging [`ExtensionBuilder`]; nothing is
//! visible until the whole batch is validated and committed, and the command
//! table is swapped as one immutable snapshot. Unloading invalidates the
//! handle before anything else, so a command resolved mid-unload fails the
//! liveness gate instead of running against a half-removed extension.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    bot::Services,
    command::{Command, ConverterRef},
    convert::{Converter, ConverterTable},
    errors::{ErrorKind, ExtensionError},
    events::{EventKind, GatewayEvent},
    funnel::Route,
    parser::CommandLookup,
    scheduler::TaskHandler,
    Error, Result,
};

const SETUP_TIMEOUT: Duration = Duration::from_secs(30);
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// An independently loadable bundle of commands and listeners.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Register everything through `ext`. An error discards the whole batch.
    async fn setup(&self, ext: &mut ExtensionBuilder) -> Result<()>;

    /// Runs on unload (and on the replaced instance after a reload).
    async fn teardown(&self, _services: &Arc<Services>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait Listener: Send + Sync {
    async fn on_event(&self, event: &GatewayEvent, services: &Arc<Services>) -> Result<()>;
}

type Factory = Arc<dyn Fn() -> Arc<dyn Extension> + Send + Sync>;

/// Name -> constructor for every extension the process knows how to load.
#[derive(Clone, Default)]
pub struct ExtensionCatalog {
    factories: BTreeMap<String, Factory>,
}

impl ExtensionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Extension> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Extension> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    /// A fresh instance of the named extension.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.factories.get(name).map(|f| f())
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

/// Identity of one loaded version of an extension.
#[derive(Debug)]
pub struct ExtensionHandle {
    name: String,
    generation: u64,
    live: AtomicBool,
}

impl ExtensionHandle {
    fn new(name: &str, generation: u64) -> Self {
        Self {
            name: name.to_string(),
            generation,
            live: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.live.store(false, Ordering::Release);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtensionState {
    Unloaded,
    Loaded { generation: u64 },
    /// Last load attempt failed; holds the reason.
    Failed(String),
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => f.write_str("unloaded"),
            Self::Loaded { generation } => write!(f, "loaded (v{generation})"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Staging area handed to [`Extension::setup`].
pub struct ExtensionBuilder {
    name: String,
    services: Arc<Services>,
    converters: ConverterTable,
    commands: Vec<Command>,
    listeners: Vec<(EventKind, Arc<dyn Listener>)>,
    error_routes: Vec<(ErrorKind, Route)>,
    task_handlers: Vec<(String, Arc<dyn TaskHandler>)>,
    new_converters: Vec<(String, Arc<dyn Converter>)>,
}

impl ExtensionBuilder {
    fn new(name: &str, services: Arc<Services>, converters: ConverterTable) -> Self {
        Self {
            name: name.to_string(),
            services,
            converters,
            commands: Vec::new(),
            listeners: Vec::new(),
            error_routes: Vec::new(),
            task_handlers: Vec::new(),
            new_converters: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn command(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn listener(&mut self, kind: EventKind, listener: Arc<dyn Listener>) -> &mut Self {
        self.listeners.push((kind, listener));
        self
    }

    pub fn error_route(&mut self, kind: ErrorKind, route: Route) -> &mut Self {
        self.error_routes.push((kind, route));
        self
    }

    pub fn task_handler(
        &mut self,
        kind: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> &mut Self {
        self.task_handlers.push((kind.into(), handler));
        self
    }

    /// Make a converter available to `Param::named` under `name`.
    pub fn converter(&mut self, name: impl Into<String>, converter: Arc<dyn Converter>) -> &mut Self {
        let name = name.into();
        self.converters.insert(name.clone(), converter.clone());
        self.new_converters.push((name, converter));
        self
    }
}

/// Registered listener and the extension it belongs to.
#[derive(Clone)]
pub struct ListenerEntry {
    pub extension: String,
    pub listener: Arc<dyn Listener>,
    owner: Weak<ExtensionHandle>,
}

impl ListenerEntry {
    pub fn is_live(&self) -> bool {
        self.owner.upgrade().is_some_and(|h| h.is_live())
    }
}

/// Immutable snapshot of everything dispatchable.
#[derive(Clone, Default)]
pub struct CommandTable {
    commands: BTreeMap<String, Arc<Command>>,
    aliases: HashMap<String, String>,
    folded: HashMap<String, String>,
    case_insensitive: bool,
    listeners: HashMap<EventKind, Vec<ListenerEntry>>,
    converters: ConverterTable,
}

impl CommandTable {
    pub fn commands(&self) -> impl Iterator<Item = &Arc<Command>> {
        self.commands.values()
    }

    pub fn listeners(&self, kind: EventKind) -> &[ListenerEntry] {
        self.listeners.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl CommandLookup for CommandTable {
    fn find(&self, name: &str) -> Option<Arc<Command>> {
        if let Some(cmd) = self.commands.get(name) {
            return Some(cmd.clone());
        }
        if let Some(canonical) = self.aliases.get(name) {
            return self.commands.get(canonical).cloned();
        }
        if self.case_insensitive {
            if let Some(canonical) = self.folded.get(&name.to_lowercase()) {
                return self.commands.get(canonical).cloned();
            }
        }
        None
    }
}

struct Loaded {
    handle: Arc<ExtensionHandle>,
    instance: Arc<dyn Extension>,
    commands: Vec<Arc<Command>>,
    listeners: Vec<(EventKind, Arc<dyn Listener>)>,
    error_kinds: Vec<ErrorKind>,
    task_kinds: Vec<String>,
    converters: Vec<(String, Arc<dyn Converter>)>,
}

#[derive(Default)]
struct Lifecycle {
    loaded: BTreeMap<String, Loaded>,
    failed: BTreeMap<String, String>,
}

/// Validated contributions, ready to commit.
struct Staged {
    commands: Vec<Command>,
    listeners: Vec<(EventKind, Arc<dyn Listener>)>,
    error_routes: Vec<(ErrorKind, Route)>,
    task_handlers: Vec<(String, Arc<dyn TaskHandler>)>,
    converters: Vec<(String, Arc<dyn Converter>)>,
}

#[derive(Clone)]
pub struct ExtensionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    catalog: ExtensionCatalog,
    case_insensitive: bool,
    /// Serializes load/unload/reload. Never held by dispatch.
    lifecycle: Mutex<Lifecycle>,
    snapshot: RwLock<Arc<CommandTable>>,
    generation: AtomicU64,
}

impl ExtensionRegistry {
    pub fn new(catalog: ExtensionCatalog, case_insensitive: bool) -> Self {
        let table = CommandTable {
            case_insensitive,
            ..CommandTable::default()
        };
        Self {
            inner: Arc::new(RegistryInner {
                catalog,
                case_insensitive,
                lifecycle: Mutex::new(Lifecycle::default()),
                snapshot: RwLock::new(Arc::new(table)),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn catalog(&self) -> &ExtensionCatalog {
        &self.inner.catalog
    }

    /// Current dispatchable snapshot.
    pub fn table(&self) -> Arc<CommandTable> {
        self.inner
            .snapshot
            .read()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Command>> {
        self.table().find(name)
    }

    pub fn commands(&self) -> Vec<Arc<Command>> {
        self.table().commands().cloned().collect()
    }

    /// Live listeners for an event kind.
    pub fn listeners_for(&self, kind: EventKind) -> Vec<ListenerEntry> {
        self.table()
            .listeners(kind)
            .iter()
            .filter(|l| l.is_live())
            .cloned()
            .collect()
    }

    pub async fn state(&self, name: &str) -> ExtensionState {
        let lc = self.inner.lifecycle.lock().await;
        state_of(&lc, name)
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.inner.lifecycle.lock().await.loaded.contains_key(name)
    }

    /// Every known extension (catalog plus loaded) with its state.
    pub async fn extensions(&self) -> Vec<(String, ExtensionState)> {
        let lc = self.inner.lifecycle.lock().await;
        let mut names: Vec<String> = self.inner.catalog.names();
        names.extend(lc.loaded.keys().cloned());
        names.sort();
        names.dedup();
        names
            .into_iter()
            .map(|n| {
                let st = state_of(&lc, &n);
                (n, st)
            })
            .collect()
    }

    // ============== Lifecycle ==============

    pub async fn load(&self, name: &str, services: &Arc<Services>) -> Result<()> {
        let mut lc = self.inner.lifecycle.lock().await;
        if lc.loaded.contains_key(name) {
            return Err(ExtensionError::AlreadyLoaded(name.to_string()).into());
        }
        let instance = self
            .inner
            .catalog
            .resolve(name)
            .ok_or_else(|| ExtensionError::NotFound(name.to_string()))?;

        let staged = match self.stage(&lc, name, &instance, services).await {
            Ok(s) => s,
            Err(e) => {
                lc.failed.insert(name.to_string(), e.to_string());
                tracing::warn!(extension = %name, "extension failed to load: {e}");
                return Err(e);
            }
        };

        self.commit(&mut lc, name, instance, staged, services);
        lc.failed.remove(name);
        tracing::info!(extension = %name, "extension loaded");
        Ok(())
    }

    pub async fn unload(&self, name: &str, services: &Arc<Services>) -> Result<()> {
        let mut lc = self.inner.lifecycle.lock().await;
        let Some(old) = lc.loaded.remove(name) else {
            return Err(ExtensionError::NotLoaded(name.to_string()).into());
        };
        self.retire(&mut lc, name, old, services, true).await;
        tracing::info!(extension = %name, "extension unloaded");
        Ok(())
    }

    /// Stage the new version first; the running version is replaced only
    /// after the new one set up and validated cleanly. On failure the previous
    /// version stays loaded untouched.
    pub async fn reload(&self, name: &str, services: &Arc<Services>) -> Result<()> {
        let mut lc = self.inner.lifecycle.lock().await;
        if !lc.loaded.contains_key(name) {
            return Err(ExtensionError::NotLoaded(name.to_string()).into());
        }
        let instance = self
            .inner
            .catalog
            .resolve(name)
            .ok_or_else(|| ExtensionError::NotFound(name.to_string()))?;

        let staged = match self.stage(&lc, name, &instance, services).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(extension = %name, "reload failed, keeping previous version: {e}");
                return Err(e);
            }
        };

        if let Some(old) = lc.loaded.remove(name) {
            self.retire(&mut lc, name, old, services, false).await;
        }
        self.commit(&mut lc, name, instance, staged, services);
        tracing::info!(extension = %name, "extension reloaded");
        Ok(())
    }

    /// Unload everything, newest first. Errors are logged.
    pub async fn unload_all(&self, services: &Arc<Services>) {
        let mut lc = self.inner.lifecycle.lock().await;
        let mut names: Vec<(u64, String)> = lc
            .loaded
            .iter()
            .map(|(n, l)| (l.handle.generation(), n.clone()))
            .collect();
        names.sort_by(|a, b| b.cmp(a));

        for (_, name) in names {
            if let Some(old) = lc.loaded.remove(&name) {
                self.retire(&mut lc, &name, old, services, true).await;
                tracing::info!(extension = %name, "extension unloaded");
            }
        }
    }

    // ============== Internals ==============

    /// Run setup in isolation and validate the batch against everything else loaded.
    async fn stage(
        &self,
        lc: &Lifecycle,
        name: &str,
        instance: &Arc<dyn Extension>,
        services: &Arc<Services>,
    ) -> Result<Staged> {
        let builder = ExtensionBuilder::new(name, services.clone(), self.table().converters.clone());

        // Anything setup itself returns is a setup failure; conflicts found
        // while validating the batch are reported as they are.
        let staged = run_setup(instance.clone(), builder)
            .await
            .map_err(|source| {
                Error::from(ExtensionError::Setup {
                    name: name.to_string(),
                    source: Box::new(source),
                })
            })
            .and_then(|builder| validate(lc, name, builder, services));

        if staged.is_err() {
            // The new instance may have started resources before failing.
            run_teardown(name, instance.clone(), services.clone()).await;
        }
        staged
    }

    fn commit(
        &self,
        lc: &mut Lifecycle,
        name: &str,
        instance: Arc<dyn Extension>,
        staged: Staged,
        services: &Arc<Services>,
    ) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(ExtensionHandle::new(name, generation));

        let commands: Vec<Arc<Command>> = staged
            .commands
            .into_iter()
            .map(|mut c| {
                c.bind_owner(&handle);
                Arc::new(c)
            })
            .collect();

        // Routes and task handlers first: a command must never run before the
        // error routes it relies on exist.
        let mut error_kinds = Vec::new();
        for (kind, route) in staged.error_routes {
            services.funnel.register(kind.clone(), route);
            error_kinds.push(kind);
        }
        let mut task_kinds = Vec::new();
        for (kind, handler) in staged.task_handlers {
            services.scheduler.register_handler(kind.clone(), handler);
            task_kinds.push(kind);
        }

        lc.loaded.insert(
            name.to_string(),
            Loaded {
                handle,
                instance,
                commands,
                listeners: staged.listeners,
                error_kinds,
                task_kinds,
                converters: staged.converters,
            },
        );
        self.publish(lc);
    }

    /// Invalidate, tear down, then drop every registration of `old`.
    async fn retire(
        &self,
        lc: &mut Lifecycle,
        name: &str,
        old: Loaded,
        services: &Arc<Services>,
        forget_cooldowns: bool,
    ) {
        old.handle.invalidate();
        run_teardown(name, old.instance.clone(), services.clone()).await;
        self.publish(lc);

        for kind in &old.error_kinds {
            services.funnel.unregister(kind);
        }
        for kind in &old.task_kinds {
            services.scheduler.unregister_handler(kind);
        }
        if forget_cooldowns {
            for cmd in &old.commands {
                services.cooldowns.forget_command(cmd.name()).await;
            }
        }
    }

    /// Rebuild and swap the snapshot from the loaded set.
    fn publish(&self, lc: &Lifecycle) {
        let mut table = CommandTable {
            case_insensitive: self.inner.case_insensitive,
            ..CommandTable::default()
        };

        for (ext_name, loaded) in &lc.loaded {
            for cmd in &loaded.commands {
                table.commands.insert(cmd.name().to_string(), cmd.clone());
                table
                    .folded
                    .insert(cmd.name().to_lowercase(), cmd.name().to_string());
                for alias in cmd.aliases() {
                    table.aliases.insert(alias.clone(), cmd.name().to_string());
                    table
                        .folded
                        .insert(alias.to_lowercase(), cmd.name().to_string());
                }
            }
            for (kind, listener) in &loaded.listeners {
                table.listeners.entry(*kind).or_default().push(ListenerEntry {
                    extension: ext_name.clone(),
                    listener: listener.clone(),
                    owner: Arc::downgrade(&loaded.handle),
                });
            }
            for (conv_name, conv) in &loaded.converters {
                table.converters.insert(conv_name.clone(), conv.clone());
            }
        }

        if let Ok(mut snapshot) = self.inner.snapshot.write() {
            *snapshot = Arc::new(table);
        }
    }
}

fn state_of(lc: &Lifecycle, name: &str) -> ExtensionState {
    if let Some(l) = lc.loaded.get(name) {
        return ExtensionState::Loaded {
            generation: l.handle.generation(),
        };
    }
    match lc.failed.get(name) {
        Some(reason) => ExtensionState::Failed(reason.clone()),
        None => ExtensionState::Unloaded,
    }
}

async fn run_setup(
    instance: Arc<dyn Extension>,
    mut builder: ExtensionBuilder,
) -> Result<ExtensionBuilder> {
    let name = builder.name.clone();
    let mut join = tokio::spawn(async move {
        let res = instance.setup(&mut builder).await;
        (builder, res)
    });

    match tokio::time::timeout(SETUP_TIMEOUT, &mut join).await {
        Ok(Ok((builder, Ok(())))) => Ok(builder),
        Ok(Ok((_, Err(e)))) => Err(e),
        Ok(Err(join_err)) => Err(Error::Handler(anyhow::anyhow!(
            "setup of {name:?} panicked: {join_err}"
        ))),
        Err(_) => {
            join.abort();
            Err(Error::External(format!(
                "setup of {name:?} timed out after {SETUP_TIMEOUT:?}"
            )))
        }
    }
}

/// Best effort: failures and timeouts are logged, never propagated.
async fn run_teardown(name: &str, instance: Arc<dyn Extension>, services: Arc<Services>) {
    let mut join = tokio::spawn(async move { instance.teardown(&services).await });

    match tokio::time::timeout(TEARDOWN_TIMEOUT, &mut join).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!(extension = %name, "teardown failed: {e}"),
        Ok(Err(e)) => tracing::error!(extension = %name, "teardown panicked: {e}"),
        Err(_) => {
            join.abort();
            tracing::error!(extension = %name, "teardown timed out after {TEARDOWN_TIMEOUT:?}");
        }
    }
}

/// Check the staged batch for name conflicts and bind named converters.
fn validate(
    lc: &Lifecycle,
    name: &str,
    builder: ExtensionBuilder,
    services: &Arc<Services>,
) -> Result<Staged> {
    let fold = |s: &str| {
        if services.config.case_insensitive_commands {
            s.to_lowercase()
        } else {
            s.to_string()
        }
    };

    // Names claimed by other loaded extensions (the one being replaced is excluded).
    let mut taken: HashMap<String, String> = HashMap::new();
    let mut taken_errors: HashMap<ErrorKind, String> = HashMap::new();
    let mut taken_tasks: HashMap<String, String> = HashMap::new();
    let mut taken_converters: HashMap<String, String> = HashMap::new();
    for (other, loaded) in lc.loaded.iter().filter(|(n, _)| n.as_str() != name) {
        for cmd in &loaded.commands {
            taken.insert(fold(cmd.name()), other.clone());
            for alias in cmd.aliases() {
                taken.insert(fold(alias), other.clone());
            }
        }
        for kind in &loaded.error_kinds {
            taken_errors.insert(kind.clone(), other.clone());
        }
        for kind in &loaded.task_kinds {
            taken_tasks.insert(kind.clone(), other.clone());
        }
        for (conv, _) in &loaded.converters {
            taken_converters.insert(conv.clone(), other.clone());
        }
    }

    let mut own: HashSet<String> = HashSet::new();
    let mut commands = Vec::with_capacity(builder.commands.len());
    for mut cmd in builder.commands {
        for label in std::iter::once(cmd.name().to_string()).chain(cmd.aliases().iter().cloned()) {
            let key = fold(&label);
            if let Some(owner) = taken.get(&key) {
                return Err(ExtensionError::CommandConflict {
                    extension: name.to_string(),
                    command: label,
                    owner: owner.clone(),
                }
                .into());
            }
            if !own.insert(key) {
                return Err(ExtensionError::CommandConflict {
                    extension: name.to_string(),
                    command: label,
                    owner: name.to_string(),
                }
                .into());
            }
        }

        for param in &mut cmd.params {
            if let ConverterRef::Named(type_name) = &param.converter {
                let Some(conv) = builder.converters.get(type_name) else {
                    return Err(ExtensionError::InvalidCommand {
                        command: cmd.name.clone(),
                        reason: format!("unknown parameter type {type_name:?}"),
                    }
                    .into());
                };
                param.converter = ConverterRef::Resolved(conv);
            }
        }
        commands.push(cmd);
    }

    let route_conflict = |key: String, owner: &str| -> Error {
        ExtensionError::RouteConflict {
            extension: name.to_string(),
            key,
            owner: owner.to_string(),
        }
        .into()
    };

    let mut seen_errors = HashSet::new();
    for (kind, _) in &builder.error_routes {
        if services.funnel.is_builtin(kind) {
            return Err(route_conflict(kind.to_string(), "core"));
        }
        if let Some(owner) = taken_errors.get(kind) {
            return Err(route_conflict(kind.to_string(), owner));
        }
        if !seen_errors.insert(kind.clone()) {
            return Err(route_conflict(kind.to_string(), name));
        }
    }

    let mut seen_tasks = HashSet::new();
    for (kind, _) in &builder.task_handlers {
        if let Some(owner) = taken_tasks.get(kind) {
            return Err(route_conflict(kind.clone(), owner));
        }
        if !seen_tasks.insert(kind.clone()) {
            return Err(route_conflict(kind.clone(), name));
        }
    }

    let builtin = ConverterTable::builtin();
    let mut seen_converters = HashSet::new();
    for (conv, _) in &builder.new_converters {
        if builtin.contains(conv) {
            return Err(route_conflict(conv.clone(), "core"));
        }
        if let Some(owner) = taken_converters.get(conv) {
            return Err(route_conflict(conv.clone(), owner));
        }
        if !seen_converters.insert(conv.clone()) {
            return Err(route_conflict(conv.clone(), name));
        }
    }

    Ok(Staged {
        commands,
        listeners: builder.listeners,
        error_routes: builder.error_routes,
        task_handlers: builder.task_handlers,
        converters: builder.new_converters,
    })
}
