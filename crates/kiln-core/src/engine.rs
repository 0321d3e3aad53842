//! Engine facade: registration, compilation with caching, view resolution,
//! rendering and forks.
//!
//! Every engine holds its state behind one `Rc`. Registries, unit and file
//! caches, namespaces and statistics are themselves `Rc`s that a
//! [`Engine::fork`] shares with its parent. Context and globals are layers:
//! a fork chains new layers onto the parent's, so parent writes stay visible
//! while fork writes stay local.

use crate::ast::Node;
use crate::cache::{CacheStats, CompiledUnit, FileCache, FileEntry, UnitCache, content_hash};
use crate::codegen::generate;
use crate::config::EngineOptions;
use crate::context::{Layer, SharedLayer};
use crate::error::{CompileError, Error, ParseError, ResolutionError, RuntimeError};
use crate::eval::EvalResult;
use crate::machine::Machine;
use crate::namespace::Namespaces;
use crate::natives;
use crate::parser::parse;
use crate::plugin::{Plugin, PluginError};
use crate::registry::{DirectiveDefinition, ElementDefinition, Registry};
use crate::report::ErrorReport;
use crate::resolver::Resolver;
use crate::routine::compile_routine;
use crate::schema::PackageSchema;
use futures_util::stream::{self, LocalBoxStream};
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::SystemTime;

#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

struct EngineInner {
    options: RefCell<EngineOptions>,
    registry: Rc<RefCell<Registry>>,
    units: Rc<RefCell<UnitCache>>,
    files: Rc<RefCell<FileCache>>,
    namespaces: Rc<RefCell<Namespaces>>,
    stats: Rc<Cell<CacheStats>>,
    plugins: Rc<RefCell<Vec<String>>>,
    resolver: RefCell<Option<Rc<dyn Resolver>>>,
    context: SharedLayer,
    globals: SharedLayer,
    extensions: RefCell<HashMap<TypeId, Rc<dyn Any>>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("options", &*self.inner.options.borrow())
            .field("registry", &*self.inner.registry.borrow())
            .field("units", &self.inner.units.borrow().len())
            .field("files", &self.inner.files.borrow().len())
            .field("stats", &self.inner.stats.get())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// New engine with the built-in directives and helpers installed.
    pub fn new(options: EngineOptions) -> Self {
        let engine = Self {
            inner: Rc::new(EngineInner {
                options: RefCell::new(options),
                registry: Rc::new(RefCell::new(Registry::new())),
                units: Rc::new(RefCell::new(UnitCache::default())),
                files: Rc::new(RefCell::new(FileCache::default())),
                namespaces: Rc::new(RefCell::new(Namespaces::default())),
                stats: Rc::new(Cell::new(CacheStats::default())),
                plugins: Rc::new(RefCell::new(Vec::new())),
                resolver: RefCell::new(None),
                context: Layer::root(),
                globals: Layer::root(),
                extensions: RefCell::new(HashMap::new()),
            }),
        };
        natives::install(&engine);
        engine
            .inner
            .plugins
            .borrow_mut()
            .push(natives::NAME.to_string());
        engine
    }

    pub fn options(&self) -> EngineOptions {
        self.inner.options.borrow().clone()
    }

    /// Adjust this engine's options. Forks keep the options they were
    /// created with.
    pub fn configure(&self, f: impl FnOnce(&mut EngineOptions)) {
        f(&mut self.inner.options.borrow_mut());
    }

    pub fn set_resolver(&self, resolver: Rc<dyn Resolver>) {
        *self.inner.resolver.borrow_mut() = Some(resolver);
    }

    pub fn resolver(&self) -> Option<Rc<dyn Resolver>> {
        self.inner.resolver.borrow().clone()
    }

    // ---- registration -------------------------------------------------------

    pub fn directive(&self, def: DirectiveDefinition) {
        tracing::debug!(directive = %def.name, "registering directive");
        self.inner.registry.borrow_mut().add_directive(def);
    }

    pub fn remove_directive(&self, name: &str) -> bool {
        self.inner
            .registry
            .borrow_mut()
            .remove_directive(name)
            .is_some()
    }

    pub fn element(&self, def: ElementDefinition) {
        tracing::debug!(element = %def.matcher.label(), "registering element");
        self.inner.registry.borrow_mut().add_element(def);
    }

    pub fn helper(&self, name: &str, f: impl Fn(&[Value]) -> EvalResult + 'static) {
        self.inner
            .registry
            .borrow_mut()
            .add_helper(name, Rc::new(f));
    }

    pub fn namespace(&self, alias: &str, root: &str) {
        self.inner.namespaces.borrow_mut().register(alias, root);
    }

    pub fn resolve_path(&self, logical: &str) -> Result<String, ResolutionError> {
        let extension = self.inner.options.borrow().extension.clone();
        self.inner.namespaces.borrow().resolve(logical, &extension)
    }

    pub fn plugin(&self, plugin: &dyn Plugin) -> Result<(), PluginError> {
        plugin.load(self)?;
        tracing::debug!(plugin = plugin.name(), "plugin loaded");
        self.inner
            .plugins
            .borrow_mut()
            .push(plugin.name().to_string());
        Ok(())
    }

    /// Attach typed state to this engine. Forks receive the same values.
    pub fn set_extension<T: Any>(&self, value: T) {
        self.inner
            .extensions
            .borrow_mut()
            .insert(TypeId::of::<T>(), Rc::new(value));
    }

    pub fn extension<T: Any>(&self) -> Option<Rc<T>> {
        let value = self
            .inner
            .extensions
            .borrow()
            .get(&TypeId::of::<T>())
            .cloned()?;
        value.downcast::<T>().ok()
    }

    // ---- state --------------------------------------------------------------

    pub fn set_global(&self, key: &str, value: Value) {
        self.inner.globals.borrow_mut().set(key, value);
    }

    pub fn global(&self, key: &str) -> Option<Value> {
        self.inner.globals.borrow().get(key)
    }

    pub fn set_context(&self, key: &str, value: Value) {
        self.inner.context.borrow_mut().set(key, value);
    }

    pub fn context_value(&self, key: &str) -> Option<Value> {
        self.inner.context.borrow().get(key)
    }

    pub(crate) fn context_layer(&self) -> SharedLayer {
        self.inner.context.clone()
    }

    pub fn registry(&self) -> Rc<RefCell<Registry>> {
        self.inner.registry.clone()
    }

    pub fn unit_cache(&self) -> Rc<RefCell<UnitCache>> {
        self.inner.units.clone()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.get()
    }

    fn bump(&self, f: impl FnOnce(&mut CacheStats)) {
        let mut stats = self.inner.stats.get();
        f(&mut stats);
        self.inner.stats.set(stats);
    }

    /// Child engine sharing registries, caches and namespaces, with context
    /// and globals layered on top of this engine's.
    pub fn fork(&self) -> Engine {
        let inner = &self.inner;
        Engine {
            inner: Rc::new(EngineInner {
                options: RefCell::new(inner.options.borrow().clone()),
                registry: inner.registry.clone(),
                units: inner.units.clone(),
                files: inner.files.clone(),
                namespaces: inner.namespaces.clone(),
                stats: inner.stats.clone(),
                plugins: inner.plugins.clone(),
                resolver: RefCell::new(inner.resolver.borrow().clone()),
                context: Layer::child(&inner.context),
                globals: Layer::child(&inner.globals),
                extensions: RefCell::new(inner.extensions.borrow().clone()),
            }),
        }
    }

    /// Drop every compiled unit and resolved file, for all forks.
    pub fn cache_clear(&self) {
        self.inner.units.borrow_mut().clear();
        self.inner.files.borrow_mut().clear();
        tracing::debug!("template caches cleared");
    }

    // ---- compilation --------------------------------------------------------

    pub fn parse(&self, source: &str) -> Result<Vec<Node>, ParseError> {
        parse(source, &self.inner.registry.borrow())
    }

    /// Compile `source`, reusing a cached unit when possible. With a key the
    /// unit is looked up by key and reused while its hash matches (or
    /// unconditionally in production); without one it is content addressed.
    pub fn compile(&self, source: &str, key: Option<&str>) -> Result<Rc<CompiledUnit>, ErrorReport> {
        let production = self.inner.options.borrow().production;
        if production {
            let cached = key.and_then(|k| self.inner.units.borrow().by_key(k));
            if let Some(unit) = cached {
                tracing::trace!(key = ?key, "compiled unit served from cache");
                self.bump(|s| s.hits += 1);
                return Ok(unit);
            }
        }

        let hash = content_hash(source);
        let cached = match key {
            Some(k) => self
                .inner
                .units
                .borrow()
                .by_key(k)
                .filter(|unit| unit.source_hash == hash),
            None => self.inner.units.borrow().by_hash(&hash),
        };
        if let Some(unit) = cached {
            tracing::trace!(key = ?key, hash = %hash, "compiled unit served from cache");
            self.bump(|s| s.hits += 1);
            return Ok(unit);
        }

        let unit = self.build(Rc::from(source), key.map(str::to_string), hash)?;
        self.inner.units.borrow_mut().insert(key, unit.clone());
        Ok(unit)
    }

    fn build(
        &self,
        source: Rc<str>,
        name: Option<String>,
        source_hash: String,
    ) -> Result<Rc<CompiledUnit>, ErrorReport> {
        let fail = |error: Error| ErrorReport::new(error).in_source(name.as_deref(), source.clone());

        let registry = self.inner.registry.clone();
        let nodes = parse(&source, &registry.borrow()).map_err(|e| fail(e.into()))?;
        let policy = self.inner.options.borrow().policy();
        let generated = generate(&nodes, registry, policy).map_err(|e| fail(e.into()))?;
        let routine = compile_routine(&generated.code, generated.is_async)
            .map_err(|e| fail(e.into()).with_routine(generated.code.as_str()))?;

        self.bump(|s| s.compilations += 1);
        tracing::debug!(
            template = name.as_deref().unwrap_or("<inline>"),
            hash = %source_hash,
            ops = routine.ops.len(),
            is_async = routine.is_async,
            "compiled template"
        );
        Ok(Rc::new(CompiledUnit {
            name,
            source_hash,
            source,
            code: generated.code,
            routine,
            created_at: SystemTime::now(),
        }))
    }

    pub fn compile_fn(&self, source: &str) -> Result<CompiledFn, ErrorReport> {
        let unit = self.compile(source, None)?;
        Ok(CompiledFn {
            engine: self.clone(),
            unit,
        })
    }

    /// Resolve, read and compile a view. Production serves the resolved-file
    /// cache without reading; otherwise the source is re-read and only
    /// recompiled when its hash changed.
    pub(crate) async fn load_view(&self, logical: &str) -> Result<Rc<CompiledUnit>, ErrorReport> {
        let resolution = |e: ResolutionError| ErrorReport::new(e).in_template(logical);

        let path = self.resolve_path(logical).map_err(resolution)?;
        let cached = self.inner.files.borrow().get(logical);
        if self.inner.options.borrow().production {
            if let Some(entry) = &cached {
                tracing::trace!(view = logical, "resolved view served from cache");
                self.bump(|s| s.hits += 1);
                return Ok(entry.unit.clone());
            }
        }

        let resolver = self
            .resolver()
            .ok_or_else(|| resolution(ResolutionError::NoResolver { path: path.clone() }))?;
        self.bump(|s| s.reads += 1);
        let source = resolver.read(&path).await.map_err(resolution)?;
        let hash = content_hash(&source);

        if let Some(entry) = cached {
            if entry.path == path && entry.content_hash == hash {
                tracing::trace!(view = logical, "view unchanged, reusing compiled unit");
                self.bump(|s| s.hits += 1);
                return Ok(entry.unit);
            }
            tracing::debug!(view = logical, path = %path, "view changed, recompiling");
        }

        let unit = self.build(Rc::from(source), Some(logical.to_string()), hash.clone())?;
        self.inner.units.borrow_mut().insert(Some(logical), unit.clone());
        self.inner.files.borrow_mut().insert(
            logical,
            FileEntry {
                path,
                content_hash: hash,
                unit: unit.clone(),
            },
        );
        Ok(unit)
    }

    // ---- rendering ----------------------------------------------------------

    /// Log a failure and turn it into a diagnostic page, unless silent.
    fn settle(&self, result: Result<String, ErrorReport>) -> Result<String, ErrorReport> {
        match result {
            Err(report) if !self.inner.options.borrow().silent => {
                tracing::error!(
                    code = report.code(),
                    template = report.template.as_deref().unwrap_or("<inline>"),
                    "{report}"
                );
                Ok(report.render_page())
            }
            other => other,
        }
    }

    async fn execute(&self, unit: Rc<CompiledUnit>, locals: Value) -> Result<String, ErrorReport> {
        Machine::new(self.clone(), unit, locals).run().await
    }

    fn execute_sync(&self, unit: Rc<CompiledUnit>, locals: Value) -> Result<String, ErrorReport> {
        if unit.routine.is_async {
            let error = CompileError::new(
                "template contains include points and must be rendered asynchronously",
            );
            return Err(ErrorReport::new(error).in_unit(&unit));
        }
        Machine::new(self.clone(), unit.clone(), locals)
            .run()
            .now_or_never()
            .unwrap_or_else(|| {
                let error = RuntimeError {
                    message: "synchronous render suspended".to_string(),
                    position: None,
                };
                Err(ErrorReport::new(error).in_unit(&unit))
            })
    }

    pub async fn render(&self, source: &str, locals: Value) -> Result<String, ErrorReport> {
        let result = match self.compile(source, None) {
            Ok(unit) => self.execute(unit, locals).await,
            Err(report) => Err(report),
        };
        self.settle(result)
    }

    /// Render a template that never suspends without an executor.
    pub fn render_sync(&self, source: &str, locals: Value) -> Result<String, ErrorReport> {
        let result = self
            .compile(source, None)
            .and_then(|unit| self.execute_sync(unit, locals));
        self.settle(result)
    }

    /// Output as a lazy stream of chunks, split at include points. When not
    /// silent a failure ends the stream with the diagnostic page as its last
    /// chunk.
    pub fn render_stream(
        &self,
        source: &str,
        locals: Value,
    ) -> LocalBoxStream<'static, Result<String, ErrorReport>> {
        let start = StreamState::Start {
            engine: self.clone(),
            source: Rc::from(source),
            locals,
        };
        stream::unfold(start, |state| async move {
            let (engine, mut machine) = match state {
                StreamState::Start {
                    engine,
                    source,
                    locals,
                } => match engine.compile(&source, None) {
                    Ok(unit) => {
                        let machine = Machine::new(engine.clone(), unit, locals);
                        (engine, machine)
                    }
                    Err(report) => return Some((engine.settle(Err(report)), StreamState::Done)),
                },
                StreamState::Running { engine, machine } => (engine, machine),
                StreamState::Done => return None,
            };
            match machine.next_chunk().await {
                Some(Ok(chunk)) => Some((Ok(chunk), StreamState::Running { engine, machine })),
                Some(Err(report)) => Some((engine.settle(Err(report)), StreamState::Done)),
                None => None,
            }
        })
        .boxed_local()
    }

    /// Resolve and render a view. Failing to resolve the view itself is
    /// always returned as an error.
    pub async fn view(&self, logical: &str, locals: Value) -> Result<String, ErrorReport> {
        let unit = match self.load_view(logical).await {
            Ok(unit) => unit,
            Err(report) if matches!(report.error, Error::Resolution(_)) => return Err(report),
            Err(report) => return self.settle(Err(report)),
        };
        let result = self.execute(unit, locals).await;
        self.settle(result)
    }

    /// Concrete paths matching a namespaced glob pattern.
    pub async fn glob(&self, pattern: &str) -> Result<Vec<String>, ResolutionError> {
        let concrete = self.inner.namespaces.borrow().resolve_pattern(pattern)?;
        let resolver = self.resolver().ok_or_else(|| ResolutionError::NoResolver {
            path: concrete.clone(),
        })?;
        resolver.readdir(&concrete).await
    }

    pub fn schema(&self, name: &str) -> PackageSchema {
        let globals = self.inner.globals.borrow().snapshot().keys().cloned().collect();
        PackageSchema::build(
            name,
            &self.inner.registry.borrow(),
            globals,
            self.inner.namespaces.borrow().mappings(),
            self.inner.plugins.borrow().clone(),
        )
    }
}

enum StreamState {
    Start {
        engine: Engine,
        source: Rc<str>,
        locals: Value,
    },
    Running {
        engine: Engine,
        machine: Machine,
    },
    Done,
}

/// A compiled template bound to the engine that compiled it.
#[derive(Clone)]
pub struct CompiledFn {
    engine: Engine,
    unit: Rc<CompiledUnit>,
}

impl CompiledFn {
    pub fn unit(&self) -> &Rc<CompiledUnit> {
        &self.unit
    }

    pub fn is_async(&self) -> bool {
        self.unit.routine.is_async
    }

    pub async fn call(&self, locals: Value) -> Result<String, ErrorReport> {
        let result = self.engine.execute(self.unit.clone(), locals).await;
        self.engine.settle(result)
    }

    pub fn call_sync(&self, locals: Value) -> Result<String, ErrorReport> {
        let result = self.engine.execute_sync(self.unit.clone(), locals);
        self.engine.settle(result)
    }
}

impl fmt::Debug for CompiledFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFn")
            .field("template", &self.unit.display_name())
            .field("hash", &self.unit.source_hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::ElementCtx;
    use crate::registry::Children;
    use crate::resolver::MemoryResolver;
    use crate::value::display_string;
    use serde_json::json;

    fn silent() -> Engine {
        Engine::new(EngineOptions::default().silent(true))
    }

    fn with_views(options: EngineOptions, files: &[(&str, &str)]) -> (Engine, Rc<MemoryResolver>) {
        let engine = Engine::new(options);
        let resolver = Rc::new(MemoryResolver::new());
        for (path, source) in files {
            resolver.insert(path, source);
        }
        engine.set_resolver(resolver.clone());
        engine.namespace("~", "/app/views");
        (engine, resolver)
    }

    #[test]
    fn escaped_and_raw_interpolation() {
        let out = silent()
            .render_sync("{{ v }}|{{{ v }}}", json!({ "v": "<b>x</b>" }))
            .expect("render");
        assert_eq!(out, "&lt;b&gt;x&lt;/b&gt;|<b>x</b>");
    }

    #[test]
    fn absent_values_render_empty() {
        let out = silent()
            .render_sync("[{{ missing }}][{{ nothing }}][{{{ it.gone }}}]", json!({ "nothing": null }))
            .expect("render");
        assert_eq!(out, "[][][]");
    }

    #[test]
    fn removed_directive_passes_through() {
        let engine = silent();
        assert!(engine.remove_directive("if"));
        let out = engine
            .render_sync("@if(true)A@end", Value::Null)
            .expect("render");
        assert_eq!(out, "@if(true)A@end");
    }

    #[test]
    fn conditionals() {
        let engine = silent();
        let render = |src: &str| engine.render_sync(src, json!({ "n": 2 })).expect("render");
        assert_eq!(render("@if(true)A@elseB@end"), "A");
        assert_eq!(render("@if(false)A@elseB@end"), "B");
        assert_eq!(render("@if(n == 1)one@elseif(n == 2)two@else other@end"), "two");
        assert_eq!(render("@unless(n > 5)small@end"), "small");
    }

    #[test]
    fn loops_with_empty_clauses_stay_independent() {
        let engine = silent();
        let src = "@for(x in a)[{{ x }}]@emptyNONE@end|@for((y, i) in b){{ i }}:{{ y }};@emptyEMPTY@end";
        let out = engine
            .render_sync(src, json!({ "a": [], "b": ["p", "q"] }))
            .expect("render");
        assert_eq!(out, "NONE|0:p;1:q;");

        let unit = engine.compile(src, None).expect("compile");
        assert!(unit.code.contains("__kiln_empty_0"));
        assert!(unit.code.contains("__kiln_empty_1"));

        let out = engine
            .render_sync("@for((v, k) in o){{ k }}={{ v }} @end", json!({ "o": { "b": 1, "a": 2 } }))
            .expect("render");
        assert_eq!(out, "b=1 a=2 ");
    }

    #[test]
    fn misplaced_empty_is_a_compile_error() {
        let err = silent()
            .render_sync("@if(true)@empty@end", Value::Null)
            .expect_err("empty outside for");
        assert_eq!(err.code(), "KILN_E_COMPILE");
        assert!(err.message().contains("@for"));
    }

    #[test]
    fn let_and_helpers() {
        let out = silent()
            .render_sync("@let(total, price * qty){{ total }} {{ upper(name) }}", json!({ "price": 3, "qty": 2, "name": "ada" }))
            .expect("render");
        assert_eq!(out, "6 ADA");
    }

    #[test]
    fn runtime_error_renders_diagnostic_page() {
        let engine = Engine::default();
        let out = engine
            .render_sync("<p>{{ user.profile.name }}</p>", json!({ "user": {} }))
            .expect("page instead of error");
        assert!(out.contains("kiln-error"));
        assert!(out.contains("profile"));
        assert!(out.contains("KILN_E_RUNTIME"));
    }

    #[test]
    fn silent_engine_returns_report() {
        let err = silent()
            .render_sync("ok\n{{ user.name }}", Value::Null)
            .expect_err("silent");
        assert_eq!(err.code(), "KILN_E_RUNTIME");
        assert!(err.message().contains("'user.name'"));
        let position = err.position.expect("position");
        assert_eq!(position.line, 2);
        assert_eq!(err.chain, vec!["<inline>".to_string()]);
        assert!(err.routine.is_some());
    }

    #[test]
    fn strict_policy_rejects_unknown_directives() {
        let engine = Engine::new(EngineOptions::default().silent(true).strict_directives(true));
        let err = engine.render_sync("@nope(1)", Value::Null).expect_err("strict");
        assert_eq!(err.code(), "KILN_E_COMPILE");

        let lenient = silent();
        assert_eq!(lenient.render_sync("@nope(1)", Value::Null).expect("render"), "@nope(1)");
    }

    #[test]
    fn parse_errors_are_reported_with_position() {
        let err = silent()
            .render_sync("a\n@if(true)b", Value::Null)
            .expect_err("unclosed");
        assert_eq!(err.code(), "KILN_E_PARSE");
        assert!(err.message().contains("@if"));
        assert_eq!(err.position.map(|p| p.line), Some(2));
    }

    #[test]
    fn keyed_compilation_is_cached_until_content_changes() {
        let engine = silent();
        let first = engine.compile("hello {{ a }}", Some("greeting")).expect("compile");
        let second = engine.compile("hello {{ a }}", Some("greeting")).expect("compile");
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(engine.stats().compilations, 1);
        assert_eq!(engine.stats().hits, 1);

        let changed = engine.compile("bye {{ a }}", Some("greeting")).expect("compile");
        assert!(!Rc::ptr_eq(&first, &changed));
        assert_eq!(engine.stats().compilations, 2);

        engine.configure(|o| o.production = true);
        let stale = engine.compile("ignored", Some("greeting")).expect("compile");
        assert!(Rc::ptr_eq(&stale, &changed));
    }

    #[test]
    fn inline_sources_are_content_addressed() {
        let engine = silent();
        let a = engine.compile("same", None).expect("compile");
        let b = engine.compile("same", None).expect("compile");
        assert!(Rc::ptr_eq(&a, &b));
        engine.cache_clear();
        let c = engine.compile("same", None).expect("compile");
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(engine.stats().compilations, 2);
    }

    #[tokio::test]
    async fn production_views_read_once() {
        let (engine, resolver) = with_views(
            EngineOptions::default().silent(true).production(true),
            &[("/app/views/home.kiln", "Hi {{ name }}")],
        );
        let locals = json!({ "name": "ada" });
        assert_eq!(engine.view("home", locals.clone()).await.expect("view"), "Hi ada");
        assert_eq!(engine.view("home", locals).await.expect("view"), "Hi ada");
        assert_eq!(resolver.reads(), 1);
        assert_eq!(engine.stats().compilations, 1);

        resolver.insert("/app/views/home.kiln", "changed");
        assert_eq!(engine.view("home", Value::Null).await.expect("view"), "Hi ");
    }

    #[tokio::test]
    async fn development_views_recompile_only_on_change() {
        let (engine, resolver) = with_views(
            EngineOptions::default().silent(true),
            &[("/app/views/home.kiln", "v1")],
        );
        assert_eq!(engine.view("home", Value::Null).await.expect("view"), "v1");
        assert_eq!(engine.view("~/home", Value::Null).await.expect("view"), "v1");
        assert_eq!(engine.view("home", Value::Null).await.expect("view"), "v1");
        assert_eq!(resolver.reads(), 3);
        assert_eq!(engine.stats().reads, 3);

        resolver.insert("/app/views/home.kiln", "v2");
        assert_eq!(engine.view("home", Value::Null).await.expect("view"), "v2");
        // "home" twice and "~/home" once
        assert_eq!(engine.stats().compilations, 3);
    }

    #[tokio::test]
    async fn missing_views_are_always_errors() {
        let (engine, _) = with_views(EngineOptions::default(), &[]);
        let err = engine.view("nope", Value::Null).await.expect_err("missing");
        assert_eq!(err.code(), "KILN_E_RESOLVE");

        let bare = Engine::default();
        let err = bare.view("/x", Value::Null).await.expect_err("no resolver");
        assert!(matches!(
            err.error,
            Error::Resolution(ResolutionError::NoResolver { .. })
        ));
    }

    #[tokio::test]
    async fn includes_merge_locals() {
        let (engine, _) = with_views(
            EngineOptions::default().silent(true),
            &[
                ("/app/views/page.kiln", "<main>@include('partials.nav', { active: 'home' })</main>"),
                ("/app/views/partials/nav.kiln", "nav:{{ active }}:{{ title }}"),
            ],
        );
        let out = engine.view("page", json!({ "title": "T" })).await.expect("view");
        assert_eq!(out, "<main>nav:home:T</main>");
    }

    #[tokio::test]
    async fn soft_includes_skip_missing_views() {
        let (engine, _) = with_views(EngineOptions::default().silent(true), &[]);
        let out = engine
            .render("a@include('missing')b", Value::Null)
            .await
            .expect("render");
        assert_eq!(out, "ab");

        let err = engine
            .render("a@require('missing')b", Value::Null)
            .await
            .expect_err("strict include");
        assert_eq!(err.code(), "KILN_E_RESOLVE");
        assert_eq!(err.chain, vec!["<inline>".to_string(), "missing".to_string()]);
    }

    #[tokio::test]
    async fn nested_failures_name_the_child() {
        let (engine, _) = with_views(
            EngineOptions::default().silent(true),
            &[
                ("/app/views/page.kiln", "top @include('broken')"),
                ("/app/views/broken.kiln", "x\n{{ a.b.c }}"),
                ("/app/views/bad.kiln", "@if(true)"),
                ("/app/views/outer.kiln", "@include('bad')"),
            ],
        );
        let err = engine.view("page", Value::Null).await.expect_err("runtime");
        assert_eq!(err.code(), "KILN_E_RUNTIME");
        assert_eq!(err.template.as_deref(), Some("broken"));
        assert_eq!(err.chain, vec!["page".to_string(), "broken".to_string()]);
        assert_eq!(err.stack.len(), 2);
        assert!(err.stack[0].starts_with("at broken:2:"));

        let err = engine.view("outer", Value::Null).await.expect_err("parse");
        assert_eq!(err.code(), "KILN_E_PARSE");
        assert_eq!(err.chain, vec!["outer".to_string(), "bad".to_string()]);
    }

    #[tokio::test]
    async fn stream_chunks_match_render() {
        let (engine, _) = with_views(
            EngineOptions::default().silent(true),
            &[("/app/views/nav.kiln", "<nav>{{ n }}</nav>")],
        );
        let src = "<header>@include('nav')</header><p>@include('nav', { n: 2 })</p>";
        let locals = json!({ "n": 1 });
        let chunks: Vec<String> = engine
            .render_stream(src, locals.clone())
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .expect("stream");
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0], "<header>");
        let whole = engine.render(src, locals).await.expect("render");
        assert_eq!(chunks.concat(), whole);
        assert_eq!(whole, "<header><nav>1</nav></header><p><nav>2</nav></p>");
    }

    #[tokio::test]
    async fn stream_failure_ends_with_page() {
        let (engine, _) = with_views(
            EngineOptions::default(),
            &[("/app/views/broken.kiln", "x\n{{ a.b.c }}")],
        );
        let chunks: Vec<_> = engine
            .render_stream("<header>@include('broken')</header>", Value::Null)
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_deref().expect("first chunk"), "<header>");
        let page = chunks[1].as_deref().expect("page chunk");
        assert!(page.contains("kiln-error"));
        assert!(page.contains("KILN_E_RUNTIME"));
    }

    #[tokio::test]
    async fn silent_stream_failure_ends_with_report() {
        let (engine, _) = with_views(
            EngineOptions::default().silent(true),
            &[("/app/views/broken.kiln", "x\n{{ a.b.c }}")],
        );
        let mut chunks: Vec<_> = engine
            .render_stream("<header>@include('broken')</header>", Value::Null)
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        let err = chunks.pop().expect("last").expect_err("report");
        assert_eq!(err.code(), "KILN_E_RUNTIME");
        assert_eq!(err.template.as_deref(), Some("broken"));
        assert_eq!(chunks[0].as_deref().expect("first chunk"), "<header>");
    }

    #[test]
    fn sync_render_rejects_suspending_templates() {
        let err = silent()
            .render_sync("@include('x')", Value::Null)
            .expect_err("async template");
        assert_eq!(err.code(), "KILN_E_COMPILE");
    }

    #[tokio::test]
    async fn compiled_functions_rerun() {
        let engine = silent();
        let f = engine.compile_fn("{{ n * 2 }}").expect("compile");
        assert!(!f.is_async());
        assert_eq!(f.call_sync(json!({ "n": 2 })).expect("call"), "4");
        assert_eq!(f.call(json!({ "n": 5 })).await.expect("call"), "10");
    }

    #[test]
    fn forks_layer_context_and_share_caches() {
        let parent = silent();
        parent.set_context("site", json!("kiln"));
        parent.set_global("year", json!(2024));
        let fork = parent.fork();

        fork.set_context("user", json!("ada"));
        assert_eq!(parent.context_value("user"), None);
        assert_eq!(fork.context_value("site"), Some(json!("kiln")));

        parent.set_context("late", json!(true));
        assert_eq!(fork.context_value("late"), Some(json!(true)));
        fork.set_global("year", json!(2025));
        assert_eq!(parent.global("year"), Some(json!(2024)));

        assert!(Rc::ptr_eq(&parent.registry(), &fork.registry()));
        assert!(Rc::ptr_eq(&parent.unit_cache(), &fork.unit_cache()));

        let compiled = fork.compile("{{ $ctx.user }}", Some("who")).expect("compile");
        let reused = parent.compile("{{ $ctx.user }}", Some("who")).expect("compile");
        assert!(Rc::ptr_eq(&compiled, &reused));
        assert_eq!(parent.stats().compilations, 1);

        assert_eq!(
            fork.render_sync("{{ $ctx.site }}/{{ $ctx.user }}/{{ year }}", Value::Null)
                .expect("render"),
            "kiln/ada/2025"
        );
        assert_eq!(
            parent.render_sync("{{ $ctx.user }}/{{ year }}", Value::Null)
                .expect("render"),
            "/2024"
        );
    }

    #[test]
    fn resolve_paths() {
        let engine = Engine::default();
        engine.namespace("~", "/app/views");
        assert_eq!(engine.resolve_path("~/header").expect("resolve"), "/app/views/header.kiln");
        assert_eq!(engine.resolve_path("/a/b").expect("resolve"), "/a/b.kiln");
        engine.configure(|o| o.extension = "html".into());
        assert_eq!(engine.resolve_path("mail.welcome").expect("resolve"), "/app/views/mail/welcome.html");
    }

    struct Cards {
        class: &'static str,
    }

    impl Plugin for Cards {
        fn name(&self) -> &str {
            "cards"
        }

        fn load(&self, engine: &Engine) -> Result<(), PluginError> {
            let class = self.class;
            engine.element(ElementDefinition::new("x-card", move |ctx: &mut ElementCtx<'_>| {
                let body = ctx.unique_id("card");
                ctx.capture_inner(&body)?;
                ctx.raw(&format!("raw '<div class=\"{class}\">' + {body} + '</div>'"));
                Ok(())
            }));
            engine.element(ElementDefinition::new("x-*", |_ctx: &mut ElementCtx<'_>| Ok(())));
            engine.directive(
                DirectiveDefinition::new("card", |ctx| {
                    ctx.raw("text \"<section>\"");
                    ctx.render_children()?;
                    ctx.raw("text \"</section>\"");
                    Ok(())
                })
                .children(Children::Yes),
            );
            engine.helper("str.shout", |args| {
                let text = args.first().map(display_string).unwrap_or_default();
                Ok(json!(format!("{text}!")))
            });
            engine.set_extension(self.class.to_string());
            Ok(())
        }
    }

    #[test]
    fn plugins_register_elements_directives_and_helpers() {
        let engine = silent();
        engine.plugin(&Cards { class: "card" }).expect("plugin");
        let out = engine
            .render_sync("<x-card>hi {{ str.shout(n) }}</x-card>@card()x@end", json!({ "n": 1 }))
            .expect("render");
        assert_eq!(out, "<div class=\"card\">hi 1!</div><section>x</section>");
        assert_eq!(engine.extension::<String>().as_deref().map(String::as_str), Some("card"));
        assert_eq!(engine.fork().extension::<String>().as_deref().map(String::as_str), Some("card"));
    }

    #[test]
    fn spread_attributes_last_write_wins() {
        let engine = silent();
        engine.plugin(&Cards { class: "card" }).expect("plugin");
        let out = engine
            .render_sync(
                r#"<x-box class="a" {...extra} data-n={ n + 1 } />"#,
                json!({ "extra": { "class": "b", "id": "z" }, "n": 1 }),
            )
            .expect("render");
        assert_eq!(out, r#"<x-box class="b" id="z" data-n="2" />"#);
    }

    #[test]
    fn element_attributes_ignore_helper_overrides() {
        let engine = silent();
        engine.plugin(&Cards { class: "card" }).expect("plugin");
        engine.helper("attrs", |_| Ok(json!(" HIJACKED")));
        let out = engine
            .render_sync("<x-box id={ n } />{{{ attrs(1) }}}", json!({ "n": 3 }))
            .expect("render");
        assert_eq!(out, r#"<x-box id="3" /> HIJACKED"#);
    }

    #[tokio::test]
    async fn glob_uses_namespaces() {
        let (engine, _) = with_views(
            EngineOptions::default(),
            &[
                ("/app/views/a.kiln", ""),
                ("/app/views/blog/b.kiln", ""),
                ("/app/views/c.txt", ""),
            ],
        );
        let found = engine.glob("~/**/*.kiln").await.expect("glob");
        assert_eq!(found, vec!["/app/views/a.kiln".to_string(), "/app/views/blog/b.kiln".to_string()]);
    }

    #[test]
    fn schema_lists_registrations() {
        let engine = Engine::default();
        engine.set_global("site", json!("kiln"));
        engine.namespace("~", "/app/views");
        let schema = engine.schema("kiln");
        let for_directive = schema.directive("for").expect("for");
        assert_eq!(for_directive.children, Children::Yes);
        assert!(for_directive.example.is_some());
        assert!(schema.directive("include").is_some());
        assert!(schema.helpers.contains(&"upper".to_string()));
        assert_eq!(schema.globals, vec!["site".to_string()]);
        assert_eq!(schema.plugins, vec![natives::NAME.to_string()]);
        let json = schema.to_json().expect("json");
        assert!(json.contains("\"name\": \"if\""));
    }
}
