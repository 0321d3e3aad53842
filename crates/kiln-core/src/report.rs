//! Diagnostics for failed compilations and renders.
//!
//! An [`ErrorReport`] wraps the underlying [`Error`] with everything needed to
//! locate it: the failing template, its source, the generated routine, the
//! chain of templates that were being rendered and a frame stack.

use crate::cache::CompiledUnit;
use crate::error::{Error, Position};
use crate::value::escape_html;
use miette::{Diagnostic, GraphicalReportHandler, GraphicalTheme, NamedSource, SourceSpan};
use std::fmt;
use std::rc::Rc;
use thiserror::Error as ThisError;

/// Marker embedded in every diagnostic page.
pub const PAGE_MARKER: &str = "kiln-error";

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub error: Error,
    /// Logical path or cache key of the failing template.
    pub template: Option<String>,
    pub source: Option<Rc<str>>,
    /// Generated routine source, when code generation got that far.
    pub routine: Option<String>,
    pub position: Option<Position>,
    /// Templates in flight, outermost first.
    pub chain: Vec<String>,
    /// Innermost frame first.
    pub stack: Vec<String>,
}

#[derive(Debug, ThisError, Diagnostic)]
#[error("{message}")]
struct CodeFrame {
    message: String,
    #[source_code]
    src: NamedSource<String>,
    #[label("here")]
    span: SourceSpan,
}

impl ErrorReport {
    pub fn new(error: impl Into<Error>) -> Self {
        Self {
            error: error.into(),
            template: None,
            source: None,
            routine: None,
            position: None,
            chain: Vec::new(),
            stack: Vec::new(),
        }
    }

    /// Attach a template source; the error offset, if any, is located in it.
    pub fn in_source(mut self, name: Option<&str>, source: Rc<str>) -> Self {
        self.position = self
            .error
            .offset()
            .map(|offset| Position::locate(&source, offset));
        self.template = name.map(str::to_string);
        self.source = Some(source);
        if self.chain.is_empty() {
            self.chain.push(name.unwrap_or("<inline>").to_string());
        }
        self
    }

    pub fn in_unit(self, unit: &CompiledUnit) -> Self {
        let mut report = self.in_source(unit.name.as_deref(), unit.source.clone());
        report.routine = Some(unit.code.clone());
        report
    }

    pub fn with_routine(mut self, code: impl Into<String>) -> Self {
        self.routine = Some(code.into());
        self
    }

    pub fn in_template(mut self, name: &str) -> Self {
        self.template = Some(name.to_string());
        if self.chain.is_empty() {
            self.chain.push(name.to_string());
        }
        self
    }

    pub fn code(&self) -> &'static str {
        self.error.code()
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }

    /// The offending source slice with a marker under the failing offset.
    pub fn code_frame(&self) -> Option<String> {
        let source = self.source.as_ref()?;
        let position = self.position?;
        let len = source[position.offset..]
            .chars()
            .next()
            .map(char::len_utf8)
            .unwrap_or(0);
        let frame = CodeFrame {
            message: self.message(),
            src: NamedSource::new(
                self.template.as_deref().unwrap_or("<inline>"),
                source.to_string(),
            ),
            span: SourceSpan::from((position.offset, len)),
        };
        let mut out = String::new();
        GraphicalReportHandler::new_themed(GraphicalTheme::unicode_nocolor())
            .render_report(&mut out, &frame)
            .ok()?;
        Some(out)
    }

    /// Self-contained HTML page describing the failure.
    pub fn render_page(&self) -> String {
        let mut body = String::new();
        body.push_str(&format!(
            "<h1><span class=\"code\">{}</span> {}</h1>\n",
            self.code(),
            escape_html(&self.message())
        ));
        if let Some(template) = &self.template {
            let at = self
                .position
                .map(|p| format!(":{p}"))
                .unwrap_or_default();
            body.push_str(&format!(
                "<p class=\"template\">{}{at}</p>\n",
                escape_html(template)
            ));
        }
        if let Some(frame) = self.code_frame() {
            section(&mut body, "Source", &frame);
        }
        if !self.stack.is_empty() {
            section(&mut body, "Stack", &self.stack.join("\n"));
        }
        if !self.chain.is_empty() {
            section(&mut body, "Compilation chain", &self.chain.join("\n  -> "));
        }
        if let Some(routine) = &self.routine {
            section(&mut body, "Generated routine", &numbered(routine));
        }
        format!(
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
             <title>{code}</title>\n<style>{STYLE}</style>\n</head>\n\
             <body class=\"{PAGE_MARKER}\" data-{PAGE_MARKER}=\"{code}\">\n{body}</body>\n</html>\n",
            code = self.code(),
        )
    }
}

const STYLE: &str = "body{font-family:ui-monospace,monospace;margin:2rem;background:#1d1f21;color:#e0e0e0}\
h1{color:#ff6b6b;font-size:1.2rem}.code{background:#ff6b6b;color:#1d1f21;padding:0 .4rem}\
h2{font-size:1rem;color:#8abeb7}pre{background:#282a2e;padding:1rem;overflow:auto}";

fn section(body: &mut String, title: &str, content: &str) {
    body.push_str(&format!(
        "<h2>{title}</h2>\n<pre>{}</pre>\n",
        escape_html(content)
    ));
}

fn numbered(code: &str) -> String {
    code.lines()
        .enumerate()
        .map(|(i, line)| format!("{:>4} | {line}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.error)?;
        if let Some(template) = &self.template {
            write!(f, " in {template}")?;
            if let Some(position) = self.position {
                write!(f, ":{position}")?;
            }
        }
        if self.chain.len() > 1 {
            write!(f, " (via {})", self.chain.join(" -> "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorReport {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ParseError, RuntimeError};

    fn runtime_report() -> ErrorReport {
        let source: Rc<str> = Rc::from("<p>\n  {{ user.name }}\n</p>");
        ErrorReport::new(RuntimeError {
            message: "cannot read property 'name' of undefined (evaluating 'user')".into(),
            position: Some(6),
        })
        .in_source(Some("profile"), source)
        .with_routine("text \"<p>\\n  \"\npos 6\nescape user.name")
    }

    #[test]
    fn locates_error_in_source() {
        let report = runtime_report();
        let position = report.position.expect("position");
        assert_eq!((position.line, position.column), (2, 3));
        assert_eq!(report.chain, vec!["profile".to_string()]);
        assert_eq!(
            report.to_string(),
            "[KILN_E_RUNTIME] cannot read property 'name' of undefined (evaluating 'user') in profile:2:3"
        );
    }

    #[test]
    fn code_frame_shows_offending_line() {
        let frame = runtime_report().code_frame().expect("frame");
        assert!(frame.contains("{{ user.name }}"));
        assert!(frame.contains("profile"));
    }

    #[test]
    fn page_is_escaped_and_marked() {
        let page = runtime_report().render_page();
        assert!(page.contains(PAGE_MARKER));
        assert!(page.contains("KILN_E_RUNTIME"));
        assert!(page.contains("Generated routine"));
        assert!(page.contains("&lt;p&gt;"));
        assert!(!page.contains("<p>\n  {{"));
    }

    #[test]
    fn reports_without_source_have_no_frame() {
        let report = ErrorReport::new(ParseError::new("unexpected", "abc", 1));
        assert!(report.code_frame().is_none());
        assert!(report.render_page().contains("KILN_E_PARSE"));
    }
}
