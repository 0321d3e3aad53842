//! Routine source to executable op program.
//!
//! Routine source is line oriented (one statement per line). Block
//! statements are lowered to jumps, so the executor only ever needs a program
//! counter and a loop stack.

use crate::error::CompileError;
use crate::expr::{Expr, parse_expr, parse_expr_prefix};
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Text(Rc<str>),
    Escape(Expr),
    Raw(Expr),
    /// Evaluate an attribute map and write it as ` key="value"` pairs.
    Attrs(Expr),
    Let(Rc<str>, Expr),
    /// Jump to the target when the condition is falsy.
    JumpUnless(Expr, usize),
    Jump(usize),
    /// Evaluate the iterable; jump to `exit` when it has no entries.
    ForStart {
        item: Rc<str>,
        key: Option<Rc<str>>,
        iterable: Expr,
        exit: usize,
    },
    /// Advance the innermost loop, jumping back to the op after `start`.
    ForNext { start: usize },
    CaptureStart,
    CaptureEnd(Rc<str>),
    /// Render another view in place. A suspension point.
    Include {
        path: Expr,
        with: Option<Expr>,
        soft: bool,
    },
    Pos(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Routine {
    pub ops: Vec<Op>,
    pub is_async: bool,
    /// Routine source line (1-based) of each op.
    pub lines: Vec<usize>,
}

enum Block {
    If {
        line: usize,
        pending: Option<usize>,
        exits: Vec<usize>,
        has_else: bool,
    },
    For {
        line: usize,
        start: usize,
    },
    Capture {
        line: usize,
        var: Rc<str>,
    },
}

impl Block {
    fn describe(&self) -> (&'static str, usize) {
        match self {
            Block::If { line, .. } => ("if", *line),
            Block::For { line, .. } => ("for", *line),
            Block::Capture { line, .. } => ("capture", *line),
        }
    }
}

struct Compiler {
    ops: Vec<Op>,
    lines: Vec<usize>,
    blocks: Vec<Block>,
    is_async: bool,
}

pub fn compile_routine(code: &str, is_async: bool) -> Result<Routine, CompileError> {
    let mut compiler = Compiler {
        ops: Vec::new(),
        lines: Vec::new(),
        blocks: Vec::new(),
        is_async,
    };
    for (index, line) in code.lines().enumerate() {
        compiler.statement(line.trim(), index + 1)?;
    }
    if let Some(block) = compiler.blocks.last() {
        let (kind, line) = block.describe();
        return Err(CompileError::on_line(
            format!("`{kind}` opened on line {line} is never closed"),
            line,
        ));
    }
    Ok(Routine {
        ops: compiler.ops,
        is_async,
        lines: compiler.lines,
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

impl Compiler {
    fn push(&mut self, op: Op, line: usize) -> usize {
        self.ops.push(op);
        self.lines.push(line);
        self.ops.len() - 1
    }

    fn patch(&mut self, at: usize) {
        let target = self.ops.len();
        match &mut self.ops[at] {
            Op::JumpUnless(_, to) | Op::Jump(to) => *to = target,
            Op::ForStart { exit, .. } => *exit = target,
            _ => {}
        }
    }

    fn expr(&self, src: &str, line: usize) -> Result<Expr, CompileError> {
        parse_expr(src).map_err(|e| {
            CompileError::on_line(format!("invalid expression `{src}`: {}", e.message), line)
        })
    }

    fn ident(&self, name: &str, line: usize) -> Result<Rc<str>, CompileError> {
        if is_identifier(name) {
            Ok(Rc::from(name))
        } else {
            Err(CompileError::on_line(
                format!("`{name}` is not a valid variable name"),
                line,
            ))
        }
    }

    fn statement(&mut self, stmt: &str, line: usize) -> Result<(), CompileError> {
        if stmt.is_empty() || stmt.starts_with('#') {
            return Ok(());
        }
        let (keyword, rest) = match stmt.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (stmt, ""),
        };

        match keyword {
            "text" => {
                let text: String = serde_json::from_str(rest).map_err(|e| {
                    CompileError::on_line(format!("invalid text literal: {e}"), line)
                })?;
                self.push(Op::Text(Rc::from(text)), line);
            }
            "escape" => {
                let expr = self.expr(rest, line)?;
                self.push(Op::Escape(expr), line);
            }
            "raw" => {
                let expr = self.expr(rest, line)?;
                self.push(Op::Raw(expr), line);
            }
            "attrs" => {
                let expr = self.expr(rest, line)?;
                self.push(Op::Attrs(expr), line);
            }
            "let" => {
                let Some((name, value)) = rest.split_once('=') else {
                    return Err(CompileError::on_line("expected `let <name> = <expr>`", line));
                };
                let name = self.ident(name.trim(), line)?;
                let expr = self.expr(value.trim(), line)?;
                self.push(Op::Let(name, expr), line);
            }
            "pos" => {
                let offset = rest.parse::<usize>().map_err(|_| {
                    CompileError::on_line(format!("invalid position `{rest}`"), line)
                })?;
                self.push(Op::Pos(offset), line);
            }
            "if" => {
                let cond = self.expr(rest, line)?;
                let at = self.push(Op::JumpUnless(cond, 0), line);
                self.blocks.push(Block::If {
                    line,
                    pending: Some(at),
                    exits: Vec::new(),
                    has_else: false,
                });
            }
            "elif" => {
                let cond = self.expr(rest, line)?;
                let exit = self.open_branch(line, "elif")?;
                self.push_exit(exit);
                let at = self.push(Op::JumpUnless(cond, 0), line);
                if let Some(Block::If { pending, .. }) = self.blocks.last_mut() {
                    *pending = Some(at);
                }
            }
            "else" => {
                let exit = self.open_branch(line, "else")?;
                self.push_exit(exit);
                if let Some(Block::If { has_else, .. }) = self.blocks.last_mut() {
                    *has_else = true;
                }
            }
            "for" => {
                let Some((vars, iterable)) = rest.split_once(" in ") else {
                    return Err(CompileError::on_line(
                        "expected `for <item>[, <key>] in <expr>`",
                        line,
                    ));
                };
                let (item, key) = match vars.split_once(',') {
                    Some((item, key)) => (
                        self.ident(item.trim(), line)?,
                        Some(self.ident(key.trim(), line)?),
                    ),
                    None => (self.ident(vars.trim(), line)?, None),
                };
                let iterable = self.expr(iterable.trim(), line)?;
                let start = self.push(
                    Op::ForStart {
                        item,
                        key,
                        iterable,
                        exit: 0,
                    },
                    line,
                );
                self.blocks.push(Block::For { line, start });
            }
            "capture" => {
                let var = self.ident(rest, line)?;
                self.push(Op::CaptureStart, line);
                self.blocks.push(Block::Capture { line, var });
            }
            "end" => match self.blocks.pop() {
                Some(Block::If { pending, exits, .. }) => {
                    if let Some(at) = pending {
                        self.patch(at);
                    }
                    for at in exits {
                        self.patch(at);
                    }
                }
                Some(Block::For { start, .. }) => {
                    self.push(Op::ForNext { start }, line);
                    self.patch(start);
                }
                Some(Block::Capture { var, .. }) => {
                    self.push(Op::CaptureEnd(var), line);
                }
                None => return Err(CompileError::on_line("`end` without an open block", line)),
            },
            "include" | "include!" => {
                if !self.is_async {
                    return Err(CompileError::on_line(
                        "include is a suspension point but the routine is not marked async",
                        line,
                    ));
                }
                let (path, stop) = parse_expr_prefix(rest).map_err(|e| {
                    CompileError::on_line(format!("invalid include path: {}", e.message), line)
                })?;
                let tail = rest[stop..].trim();
                let with = if tail.is_empty() {
                    None
                } else if let Some(data) = tail.strip_prefix("with") {
                    Some(self.expr(data.trim(), line)?)
                } else {
                    return Err(CompileError::on_line(
                        format!("unexpected `{tail}` after include path"),
                        line,
                    ));
                };
                self.push(
                    Op::Include {
                        path,
                        with,
                        soft: keyword == "include",
                    },
                    line,
                );
            }
            other => {
                return Err(CompileError::on_line(
                    format!("unknown statement `{other}`"),
                    line,
                ));
            }
        }
        Ok(())
    }

    /// Close the current branch of the innermost `if`: emit the jump to the
    /// block exit and point the pending conditional jump here.
    fn open_branch(&mut self, line: usize, keyword: &str) -> Result<usize, CompileError> {
        match self.blocks.last() {
            Some(Block::If {
                has_else: false, ..
            }) => {}
            Some(Block::If { .. }) => {
                return Err(CompileError::on_line(
                    format!("`{keyword}` after `else`"),
                    line,
                ));
            }
            _ => {
                return Err(CompileError::on_line(
                    format!("`{keyword}` outside of an `if` block"),
                    line,
                ));
            }
        }
        let exit = self.push(Op::Jump(0), line);
        let pending = match self.blocks.last_mut() {
            Some(Block::If { pending, .. }) => pending.take(),
            _ => None,
        };
        if let Some(at) = pending {
            self.patch(at);
        }
        Ok(exit)
    }

    fn push_exit(&mut self, exit: usize) {
        if let Some(Block::If { exits, .. }) = self.blocks.last_mut() {
            exits.push(exit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn if_else_lowers_to_jumps() {
        let routine = compile_routine("if a\ntext \"A\"\nelse\ntext \"B\"\nend", false)
            .expect("compile");
        assert_eq!(routine.ops.len(), 4);
        assert!(matches!(routine.ops[0], Op::JumpUnless(_, 3)));
        assert!(matches!(routine.ops[2], Op::Jump(4)));
        assert_eq!(routine.lines, vec![1, 2, 3, 4]);
    }

    #[test]
    fn elif_chains_patch_every_exit() {
        let routine = compile_routine(
            "if a\ntext \"A\"\nelif b\ntext \"B\"\nelse\ntext \"C\"\nend",
            false,
        )
        .expect("compile");
        let end = routine.ops.len();
        assert!(matches!(routine.ops[2], Op::Jump(to) if to == end));
        assert!(matches!(routine.ops[3], Op::JumpUnless(_, 6)));
        assert!(matches!(routine.ops[5], Op::Jump(to) if to == end));
    }

    #[test]
    fn loops_record_exit_after_next() {
        let routine =
            compile_routine("for item, i in items\nescape item\nend", false).expect("compile");
        match &routine.ops[0] {
            Op::ForStart { item, key, exit, .. } => {
                assert_eq!(&**item, "item");
                assert_eq!(key.as_deref(), Some("i"));
                assert_eq!(*exit, 3);
            }
            other => panic!("expected loop start, got {other:?}"),
        }
        assert_eq!(routine.ops[2], Op::ForNext { start: 0 });
    }

    #[test]
    fn include_requires_async_routine() {
        let err = compile_routine("include 'a'", false).expect_err("sync include");
        assert_eq!(err.line, Some(1));

        let routine =
            compile_routine("include! 'nav' with { active: 1 }", true).expect("compile");
        assert!(matches!(
            &routine.ops[0],
            Op::Include { soft: false, with: Some(_), .. }
        ));
    }

    #[test]
    fn attrs_is_a_statement() {
        let routine = compile_routine("attrs { id: n, ...rest }", false).expect("compile");
        assert!(matches!(&routine.ops[0], Op::Attrs(Expr::Object(_))));
    }

    #[test]
    fn malformed_source_reports_line() {
        let err = compile_routine("text \"a\"\nend", false).expect_err("stray end");
        assert_eq!(err.line, Some(2));
        let err = compile_routine("if a\ntext \"a\"", false).expect_err("unclosed");
        assert!(err.message.contains("never closed"));
        let err = compile_routine("\nfrobnicate x", false).expect_err("unknown");
        assert_eq!(err.line, Some(2));
        let err = compile_routine("escape a +", false).expect_err("bad expr");
        assert!(err.message.contains("invalid expression"));
    }
}
