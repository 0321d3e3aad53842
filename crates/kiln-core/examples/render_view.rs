//! Render a view from a directory: resolve → read → compile → run.
//!
//! Usage: cargo run -p kiln-core --example render_view -- <views-dir> <view> [locals.json]
//!
//! `RUST_LOG=kiln_core=debug` shows compile and cache decisions.

use kiln_core::{Engine, EngineOptions, FsResolver};
use serde_json::Value;
use std::env;
use std::fs;
use std::process;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let mut args = env::args().skip(1);
    let (Some(root), Some(view)) = (args.next(), args.next()) else {
        eprintln!("Usage: render_view <views-dir> <view> [locals.json]");
        eprintln!("  e.g. cargo run -p kiln-core --example render_view -- ./views pages.home");
        process::exit(1);
    };
    let locals = match args.next() {
        Some(path) => {
            let raw = fs::read_to_string(&path).unwrap_or_else(|e| {
                eprintln!("read {}: {}", path, e);
                process::exit(1);
            });
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                eprintln!("parse {}: {}", path, e);
                process::exit(1);
            })
        }
        None => Value::Null,
    };

    let engine = Engine::new(EngineOptions::from_env().silent(true));
    engine.set_resolver(Rc::new(FsResolver::new()));
    engine.namespace("~", &root);

    match engine.view(&view, locals).await {
        Ok(html) => println!("{html}"),
        Err(report) => {
            eprintln!("{report}");
            if let Some(frame) = report.code_frame() {
                eprintln!("{frame}");
            }
            for line in &report.stack {
                eprintln!("  {line}");
            }
            process::exit(1);
        }
    }
}
