//! Routine executor.
//!
//! The machine keeps an explicit stack of frames, one per template being
//! rendered. Ops run synchronously until an `include` is reached; that is
//! the only point where the machine awaits, so routines without includes
//! complete in a single poll.

use crate::cache::CompiledUnit;
use crate::context::{Layer, SharedLayer};
use crate::engine::Engine;
use crate::error::{Error, Position, RuntimeError};
use crate::eval::{EvalError, EvalResult, Scope, evaluate};
use crate::expr::Expr;
use crate::report::ErrorReport;
use crate::routine::Op;
use crate::value::{display_string, escape_html, render_attributes, truthy, type_name};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::rc::Rc;

/// Nested includes deeper than this are treated as a cycle.
const MAX_DEPTH: usize = 64;

struct LoopState {
    start: usize,
    entries: Vec<(Value, Value)>,
    index: usize,
    item: Rc<str>,
    key: Option<Rc<str>>,
    shadowed: Vec<(Rc<str>, Option<Value>)>,
}

struct Frame {
    unit: Rc<CompiledUnit>,
    pc: usize,
    vars: HashMap<Rc<str>, Value>,
    /// Locals bound to the implicit variable.
    it: Value,
    loops: Vec<LoopState>,
    pos: Option<usize>,
}

impl Frame {
    fn new(unit: Rc<CompiledUnit>, it: Value) -> Self {
        Self {
            unit,
            pc: 0,
            vars: HashMap::new(),
            it,
            loops: Vec::new(),
            pos: None,
        }
    }

    fn location(&self) -> String {
        let name = self.unit.display_name();
        match self.pos {
            Some(offset) => format!("at {name}:{}", Position::locate(&self.unit.source, offset)),
            None => format!("at {name}"),
        }
    }
}

struct IncludeRequest {
    path: String,
    with: Map<String, Value>,
    soft: bool,
}

pub(crate) struct Machine {
    engine: Engine,
    frames: Vec<Frame>,
    ctx: SharedLayer,
    variable: String,
    out: String,
    captures: Vec<String>,
    pending: Option<IncludeRequest>,
    done: bool,
}

struct FrameScope<'a> {
    frame: &'a Frame,
    engine: &'a Engine,
    ctx: &'a SharedLayer,
    variable: &'a str,
}

impl Scope for FrameScope<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.frame.vars.get(name) {
            return Some(v.clone());
        }
        if name == self.variable {
            return Some(self.frame.it.clone());
        }
        if name == "$ctx" {
            return Some(Value::Object(self.ctx.borrow().snapshot()));
        }
        if let Some(v) = self.frame.it.as_object().and_then(|m| m.get(name)) {
            return Some(v.clone());
        }
        self.engine.global(name)
    }

    fn call(&self, name: &str, args: &[Value]) -> EvalResult {
        let helper = self.engine.registry().borrow().helper(name);
        match helper {
            Some(helper) => helper(args),
            None => Err(EvalError::new(format!("unknown helper `{name}`"))),
        }
    }
}

fn entries(iterable: Value) -> Result<Vec<(Value, Value)>, EvalError> {
    match iterable {
        Value::Array(items) => Ok(items
            .into_iter()
            .enumerate()
            .map(|(i, item)| (item, Value::from(i)))
            .collect()),
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| (v, Value::String(k)))
            .collect()),
        Value::Null => Ok(Vec::new()),
        other => Err(EvalError::new(format!(
            "cannot iterate over {}",
            type_name(&other)
        ))),
    }
}

impl Machine {
    pub(crate) fn new(engine: Engine, unit: Rc<CompiledUnit>, locals: Value) -> Self {
        let ctx = Layer::child(&engine.context_layer());
        let variable = engine.options().variable;
        Self {
            engine,
            frames: vec![Frame::new(unit, locals)],
            ctx,
            variable,
            out: String::new(),
            captures: Vec::new(),
            pending: None,
            done: false,
        }
    }

    /// Render to completion.
    pub(crate) async fn run(mut self) -> Result<String, ErrorReport> {
        let mut output = String::new();
        while let Some(chunk) = self.next_chunk().await {
            output.push_str(&chunk?);
        }
        Ok(output)
    }

    /// Output produced up to the next suspension point. `None` once the
    /// render has finished or failed.
    pub(crate) async fn next_chunk(&mut self) -> Option<Result<String, ErrorReport>> {
        if self.done {
            return None;
        }
        loop {
            if let Some(request) = self.pending.take() {
                if let Err(report) = self.include(request).await {
                    self.done = true;
                    return Some(Err(report));
                }
            }
            match self.advance() {
                Err(report) => {
                    self.done = true;
                    return Some(Err(report));
                }
                Ok(None) => {
                    self.done = true;
                    let chunk = std::mem::take(&mut self.out);
                    return (!chunk.is_empty()).then_some(Ok(chunk));
                }
                Ok(Some(request)) => {
                    self.pending = Some(request);
                    if self.captures.is_empty() && !self.out.is_empty() {
                        return Some(Ok(std::mem::take(&mut self.out)));
                    }
                }
            }
        }
    }

    fn sink(&mut self) -> &mut String {
        match self.captures.last_mut() {
            Some(capture) => capture,
            None => &mut self.out,
        }
    }

    fn eval(&self, expr: &Expr) -> EvalResult {
        let Some(frame) = self.frames.last() else {
            return Ok(Value::Null);
        };
        let scope = FrameScope {
            frame,
            engine: &self.engine,
            ctx: &self.ctx,
            variable: &self.variable,
        };
        evaluate(expr, &scope)
    }

    fn top(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    fn set_pc(&mut self, pc: usize) {
        if let Some(frame) = self.top() {
            frame.pc = pc;
        }
    }

    /// Run ops until the render finishes or reaches an include.
    fn advance(&mut self) -> Result<Option<IncludeRequest>, ErrorReport> {
        loop {
            let Some(frame) = self.frames.last() else {
                return Ok(None);
            };
            let unit = frame.unit.clone();
            let pc = frame.pc;
            let Some(op) = unit.routine.ops.get(pc) else {
                self.frames.pop();
                continue;
            };
            match self.execute(op, pc) {
                Ok(Some(request)) => return Ok(Some(request)),
                Ok(None) => {}
                Err(e) => {
                    let error = RuntimeError {
                        message: e.message,
                        position: self.frames.last().and_then(|f| f.pos),
                    };
                    return Err(self.report(error.into()));
                }
            }
        }
    }

    fn execute(&mut self, op: &Op, pc: usize) -> Result<Option<IncludeRequest>, EvalError> {
        let next = pc + 1;
        match op {
            Op::Text(text) => {
                self.sink().push_str(text);
                self.set_pc(next);
            }
            Op::Escape(expr) => {
                let value = self.eval(expr)?;
                let text = escape_html(&display_string(&value));
                self.sink().push_str(&text);
                self.set_pc(next);
            }
            Op::Raw(expr) => {
                let value = self.eval(expr)?;
                let text = display_string(&value);
                self.sink().push_str(&text);
                self.set_pc(next);
            }
            Op::Attrs(expr) => {
                let value = self.eval(expr)?;
                let text = render_attributes(&value);
                self.sink().push_str(&text);
                self.set_pc(next);
            }
            Op::Let(name, expr) => {
                let value = self.eval(expr)?;
                if let Some(frame) = self.top() {
                    frame.vars.insert(name.clone(), value);
                    frame.pc = next;
                }
            }
            Op::JumpUnless(cond, target) => {
                let value = self.eval(cond)?;
                let to = if truthy(&value) { next } else { *target };
                self.set_pc(to);
            }
            Op::Jump(target) => self.set_pc(*target),
            Op::ForStart {
                item,
                key,
                iterable,
                exit,
            } => {
                let entries = entries(self.eval(iterable)?)?;
                let Some(frame) = self.top() else {
                    return Ok(None);
                };
                if entries.is_empty() {
                    frame.pc = *exit;
                    return Ok(None);
                }
                let mut shadowed = vec![(item.clone(), frame.vars.get(item).cloned())];
                if let Some(key) = key {
                    shadowed.push((key.clone(), frame.vars.get(key).cloned()));
                }
                let state = LoopState {
                    start: pc,
                    entries,
                    index: 0,
                    item: item.clone(),
                    key: key.clone(),
                    shadowed,
                };
                bind_entry(frame, &state);
                frame.loops.push(state);
                frame.pc = next;
            }
            Op::ForNext { start } => {
                let Some(frame) = self.top() else {
                    return Ok(None);
                };
                let Some(mut state) = frame.loops.pop() else {
                    return Err(EvalError::new("loop end without an active loop"));
                };
                debug_assert_eq!(state.start, *start);
                state.index += 1;
                if state.index < state.entries.len() {
                    bind_entry(frame, &state);
                    frame.loops.push(state);
                    frame.pc = start + 1;
                } else {
                    for (name, previous) in state.shadowed {
                        match previous {
                            Some(value) => frame.vars.insert(name, value),
                            None => frame.vars.remove(&name),
                        };
                    }
                    frame.pc = next;
                }
            }
            Op::CaptureStart => {
                self.captures.push(String::new());
                self.set_pc(next);
            }
            Op::CaptureEnd(var) => {
                let captured = self.captures.pop().unwrap_or_default();
                if let Some(frame) = self.top() {
                    frame.vars.insert(var.clone(), Value::String(captured));
                    frame.pc = next;
                }
            }
            Op::Include { path, with, soft } => {
                let path = match self.eval(path)? {
                    Value::String(path) => path,
                    other => {
                        return Err(EvalError::new(format!(
                            "include path must be a string, got {}",
                            type_name(&other)
                        )));
                    }
                };
                let with = match with {
                    Some(expr) => match self.eval(expr)? {
                        Value::Object(map) => map,
                        Value::Null => Map::new(),
                        other => {
                            return Err(EvalError::new(format!(
                                "include data must be an object, got {}",
                                type_name(&other)
                            )));
                        }
                    },
                    None => Map::new(),
                };
                self.set_pc(next);
                return Ok(Some(IncludeRequest {
                    path,
                    with,
                    soft: *soft,
                }));
            }
            Op::Pos(offset) => {
                if let Some(frame) = self.top() {
                    frame.pos = Some(*offset);
                    frame.pc = next;
                }
            }
        }
        Ok(None)
    }

    async fn include(&mut self, request: IncludeRequest) -> Result<(), ErrorReport> {
        if self.frames.len() >= MAX_DEPTH {
            let error = RuntimeError {
                message: format!(
                    "include depth of {MAX_DEPTH} exceeded while including `{}`",
                    request.path
                ),
                position: self.frames.last().and_then(|f| f.pos),
            };
            return Err(self.report(error.into()));
        }
        match self.engine.load_view(&request.path).await {
            Ok(unit) => {
                let mut locals = self
                    .frames
                    .last()
                    .and_then(|f| f.it.as_object().cloned())
                    .unwrap_or_default();
                locals.extend(request.with);
                self.frames.push(Frame::new(unit, Value::Object(locals)));
                Ok(())
            }
            Err(report) if request.soft && matches!(report.error, Error::Resolution(_)) => {
                tracing::warn!(
                    view = %request.path,
                    error = %report.error,
                    "soft include skipped"
                );
                Ok(())
            }
            Err(mut report) => {
                let mut chain: Vec<String> = self
                    .frames
                    .iter()
                    .map(|f| f.unit.display_name().to_string())
                    .collect();
                chain.append(&mut report.chain);
                report.chain = chain;
                report.stack.extend(self.frames.iter().rev().map(Frame::location));
                Err(report)
            }
        }
    }

    fn report(&self, error: Error) -> ErrorReport {
        let Some(frame) = self.frames.last() else {
            return ErrorReport::new(error);
        };
        let mut report = ErrorReport::new(error).in_unit(&frame.unit);
        report.chain = self
            .frames
            .iter()
            .map(|f| f.unit.display_name().to_string())
            .collect();
        report.stack = self.frames.iter().rev().map(Frame::location).collect();
        let line = frame.unit.routine.lines.get(frame.pc);
        if let (Some(line), Some(innermost)) = (line, report.stack.first_mut()) {
            innermost.push_str(&format!(" (routine line {line})"));
        }
        report
    }
}

fn bind_entry(frame: &mut Frame, state: &LoopState) {
    if let Some((item, key)) = state.entries.get(state.index) {
        frame.vars.insert(state.item.clone(), item.clone());
        if let Some(name) = &state.key {
            frame.vars.insert(name.clone(), key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineOptions;
    use crate::engine::Engine;
    use crate::resolver::MemoryResolver;
    use serde_json::{Value, json};
    use std::rc::Rc;

    fn engine() -> Engine {
        Engine::new(EngineOptions::default().silent(true))
    }

    #[test]
    fn loop_variables_are_restored() {
        let out = engine()
            .render_sync(
                "@let(x, 'outer')@for(x in [1, 2]){{ x }}@end {{ x }}",
                Value::Null,
            )
            .expect("render");
        assert_eq!(out, "12 outer");
    }

    #[test]
    fn nested_loops_track_their_own_position() {
        let out = engine()
            .render_sync(
                "@for(row in rows)@for(cell in row){{ cell }}@end;@end",
                json!({ "rows": [[1, 2], [], [3]] }),
            )
            .expect("render");
        assert_eq!(out, "12;;3;");
    }

    #[test]
    fn iterating_a_scalar_fails() {
        let err = engine()
            .render_sync("@for(x in n){{ x }}@end", json!({ "n": 3 }))
            .expect_err("scalar");
        assert!(err.message().contains("cannot iterate over number"));
    }

    #[test]
    fn helpers_must_exist() {
        let err = engine()
            .render_sync("{{ nope(1) }}", Value::Null)
            .expect_err("unknown helper");
        assert!(err.message().contains("unknown helper `nope`"));
    }

    #[tokio::test]
    async fn recursive_includes_are_cut_off() {
        let engine = engine();
        let resolver = Rc::new(MemoryResolver::new().with("/v/loop.kiln", "x@include('loop')"));
        engine.set_resolver(resolver);
        engine.namespace("~", "/v");
        let err = engine.view("loop", Value::Null).await.expect_err("cycle");
        assert!(err.message().contains("include depth"));
        assert_eq!(err.chain.len(), 64);
    }

    #[tokio::test]
    async fn include_path_must_be_a_string() {
        let err = engine()
            .render("@include(1)", Value::Null)
            .await
            .expect_err("number path");
        assert!(err.message().contains("include path must be a string"));
    }
}
