//! Kiln core crate.
//!
//! A just-in-time template compiler. Templates mix text, HTML-like elements,
//! `{{ expr }}` interpolation and `@directive(...)` blocks. The pipeline:
//!
//! 1. `parser` turns source text into a [`Node`] tree, consulting the
//!    [`Registry`] to know which directives open blocks and which tags are
//!    elements.
//! 2. `codegen` asks each directive and element handler for routine source
//!    fragments and assembles them in `pre`, body, `post` order.
//! 3. `routine` compiles that line-oriented source into a flat op program.
//! 4. `machine` runs the program against locals, suspending only where a
//!    handler asked for it (`include`).
//!
//! The [`Engine`] ties the pipeline to content-addressed caches, namespaced
//! view resolution, layered context and forks, and turns failures into
//! [`ErrorReport`]s.

pub mod ast;
pub mod cache;
pub mod codegen;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod eval;
pub mod expr;
pub mod helpers;
mod machine;
pub mod namespace;
pub mod natives;
pub mod parser;
pub mod plugin;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod routine;
pub mod schema;
pub mod value;

pub use ast::{AttrValue, Attribute, Element, Node, Span};
pub use cache::{CacheStats, CompiledUnit};
pub use codegen::{DirectiveCtx, DirectivePolicy, ElementCtx};
pub use config::EngineOptions;
pub use engine::{CompiledFn, Engine};
pub use error::{CompileError, Error, ParseError, Position, ResolutionError, RuntimeError};
pub use eval::{EvalError, EvalResult};
pub use plugin::{Plugin, PluginError};
pub use registry::{Children, DirectiveDefinition, ElementDefinition, ElementMatcher};
pub use report::ErrorReport;
pub use resolver::{FsResolver, MemoryResolver, Resolver};
pub use schema::PackageSchema;
