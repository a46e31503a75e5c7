//! Minimal logic-less templates for configuration files.
//!
//! Syntax:
//! - `{{name}}` substitutes a variable; referencing an absent variable is an error
//! - `{{#name}}...{{/name}}` emits its body only when `name` is present
//! - `{{^name}}...{{/name}}` emits its body only when `name` is absent
//!
//! A line holding nothing but a section tag is removed entirely, so sections
//! can wrap whole lines without leaving blanks behind. Tags never span lines.

mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;

pub use store::{TemplateKind, TemplateStore};

/// Variables visible to a template. Absent keys are "undefined".
pub type TemplateVars = BTreeMap<String, String>;

/// Error type for template loading and rendering.
#[derive(Debug)]
pub enum TemplateError {
    Syntax { line: usize, message: String },
    MissingVariable { name: String, line: usize },
    Read { path: PathBuf, source: io::Error },
    /// No template of that kind for the PostgreSQL version.
    NotFound { name: String, version: String },
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::Syntax { line, message } => {
                write!(f, "template syntax error on line {}: {}", line, message)
            }
            TemplateError::MissingVariable { name, line } => {
                write!(f, "template line {} uses undefined variable '{}'", line, name)
            }
            TemplateError::Read { path, source } => {
                write!(f, "cannot read template {}: {}", path.display(), source)
            }
            TemplateError::NotFound { name, version } => {
                write!(f, "no template '{}' for PostgreSQL {}", name, version)
            }
        }
    }
}

impl std::error::Error for TemplateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TemplateError::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Var { name: String, line: usize },
    Section {
        name: String,
        inverted: bool,
        body: Vec<Node>,
    },
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

enum Tag<'a> {
    Var(&'a str),
    Open { name: &'a str, inverted: bool },
    Close(&'a str),
}

fn classify(raw: &str, line: usize) -> Result<Tag<'_>, TemplateError> {
    let tag = raw.trim();
    let (kind, name) = match tag.chars().next() {
        Some(c @ ('#' | '^' | '/')) => (Some(c), tag[1..].trim()),
        _ => (None, tag),
    };
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(TemplateError::Syntax {
            line,
            message: format!("invalid tag '{{{{{}}}}}'", raw),
        });
    }
    Ok(match kind {
        Some('#') => Tag::Open {
            name,
            inverted: false,
        },
        Some('^') => Tag::Open {
            name,
            inverted: true,
        },
        Some(_) => Tag::Close(name),
        None => Tag::Var(name),
    })
}

/// Returns the tag body if `line` is a standalone section tag.
fn standalone_section(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    matches!(inner.trim_start().chars().next(), Some('#' | '^' | '/')).then_some(inner)
}

struct Builder {
    /// Stack of open sections: (name, inverted, nodes collected so far, line).
    stack: Vec<(String, bool, Vec<Node>, usize)>,
    root: Vec<Node>,
}

impl Builder {
    fn current(&mut self) -> &mut Vec<Node> {
        match self.stack.last_mut() {
            Some((_, _, nodes, _)) => nodes,
            None => &mut self.root,
        }
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let nodes = self.current();
        if let Some(Node::Text(prev)) = nodes.last_mut() {
            prev.push_str(text);
        } else {
            nodes.push(Node::Text(text.to_string()));
        }
    }

    fn apply(&mut self, tag: Tag<'_>, line: usize) -> Result<(), TemplateError> {
        match tag {
            Tag::Var(name) => self.current().push(Node::Var {
                name: name.to_string(),
                line,
            }),
            Tag::Open { name, inverted } => {
                self.stack
                    .push((name.to_string(), inverted, Vec::new(), line));
            }
            Tag::Close(name) => {
                let (open, inverted, body, _) =
                    self.stack.pop().ok_or_else(|| TemplateError::Syntax {
                        line,
                        message: format!("closing '{}' without an open section", name),
                    })?;
                if open != name {
                    return Err(TemplateError::Syntax {
                        line,
                        message: format!("closing '{}' but '{}' is open", name, open),
                    });
                }
                self.current().push(Node::Section {
                    name: open,
                    inverted,
                    body,
                });
            }
        }
        Ok(())
    }
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut builder = Builder {
            stack: Vec::new(),
            root: Vec::new(),
        };

        for (idx, line) in source.split_inclusive('\n').enumerate() {
            let line_no = idx + 1;

            if let Some(inner) = standalone_section(line) {
                let tag = classify(inner, line_no)?;
                builder.apply(tag, line_no)?;
                continue;
            }

            let mut rest = line;
            while let Some(start) = rest.find("{{") {
                builder.push_text(&rest[..start]);
                let after = &rest[start + 2..];
                let end = after.find("}}").ok_or_else(|| TemplateError::Syntax {
                    line: line_no,
                    message: "unterminated tag".to_string(),
                })?;
                let tag = classify(&after[..end], line_no)?;
                builder.apply(tag, line_no)?;
                rest = &after[end + 2..];
            }
            builder.push_text(rest);
        }

        if let Some((name, _, _, line)) = builder.stack.pop() {
            return Err(TemplateError::Syntax {
                line,
                message: format!("section '{}' is never closed", name),
            });
        }

        Ok(Self {
            nodes: builder.root,
        })
    }

    /// Renders the template. Output depends only on `vars`.
    pub fn render(&self, vars: &TemplateVars) -> Result<String, TemplateError> {
        let mut out = String::new();
        render_nodes(&self.nodes, vars, &mut out)?;
        Ok(out)
    }

    /// Names of every variable the template refers to, sections included.
    pub fn variables(&self) -> Vec<&str> {
        let mut names = Vec::new();
        collect_names(&self.nodes, &mut names);
        names.sort_unstable();
        names.dedup();
        names
    }
}

fn render_nodes(nodes: &[Node], vars: &TemplateVars, out: &mut String) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var { name, line } => {
                let value = vars
                    .get(name)
                    .ok_or_else(|| TemplateError::MissingVariable {
                        name: name.clone(),
                        line: *line,
                    })?;
                out.push_str(value);
            }
            Node::Section {
                name,
                inverted,
                body,
            } => {
                if vars.contains_key(name) != *inverted {
                    render_nodes(body, vars, out)?;
                }
            }
        }
    }
    Ok(())
}

fn collect_names<'a>(nodes: &'a [Node], names: &mut Vec<&'a str>) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Var { name, .. } => names.push(name),
            Node::Section { name, body, .. } => {
                names.push(name);
                collect_names(body, names);
            }
        }
    }
}

/// Parses and renders in one step.
pub fn render(source: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
    Template::parse(source)?.render(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> TemplateVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitution() {
        let out = render("shared_buffers = {{shared_buffers_mb}}MB\n", &vars(&[("shared_buffers_mb", "512")])).unwrap();
        assert_eq!(out, "shared_buffers = 512MB\n");
    }

    #[test]
    fn test_missing_variable_is_error() {
        let err = render("a\nport = {{port}}\n", &TemplateVars::new()).unwrap_err();
        match err {
            TemplateError::MissingVariable { name, line } => {
                assert_eq!(name, "port");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_standalone_sections_leave_no_blank_lines() {
        let source = "\
a = 1
{{#random_page_cost}}
random_page_cost = {{random_page_cost}}
{{/random_page_cost}}
{{^random_page_cost}}
#random_page_cost = 4.0
{{/random_page_cost}}
b = 2
";
        let present = render(source, &vars(&[("random_page_cost", "1.1")])).unwrap();
        assert_eq!(present, "a = 1\nrandom_page_cost = 1.1\nb = 2\n");

        let absent = render(source, &TemplateVars::new()).unwrap();
        assert_eq!(absent, "a = 1\n#random_page_cost = 4.0\nb = 2\n");
    }

    #[test]
    fn test_inline_section() {
        let out = render("ssl = {{#ssl_key_file}}on{{/ssl_key_file}}{{^ssl_key_file}}off{{/ssl_key_file}}\n", &TemplateVars::new()).unwrap();
        assert_eq!(out, "ssl = off\n");
    }

    #[test]
    fn test_nested_sections() {
        let source = "{{#a}}\n{{#b}}\nboth\n{{/b}}\n{{/a}}\n";
        assert_eq!(render(source, &vars(&[("a", "1"), ("b", "1")])).unwrap(), "both\n");
        assert_eq!(render(source, &vars(&[("a", "1")])).unwrap(), "");
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(
            Template::parse("{{#a}}\nx\n"),
            Err(TemplateError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            Template::parse("{{#a}}\n{{/b}}\n"),
            Err(TemplateError::Syntax { line: 2, .. })
        ));
        assert!(matches!(
            Template::parse("x = {{oops\n"),
            Err(TemplateError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            Template::parse("x = {{bad name}}\n"),
            Err(TemplateError::Syntax { .. })
        ));
        assert!(matches!(
            Template::parse("{{/a}}\n"),
            Err(TemplateError::Syntax { .. })
        ));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let t = Template::parse("{{x}} {{y}}\n{{#z}}\nz\n{{/z}}\n").unwrap();
        let v = vars(&[("x", "1"), ("y", "2")]);
        assert_eq!(t.render(&v).unwrap(), t.render(&v).unwrap());
    }

    #[test]
    fn test_variables() {
        let t = Template::parse("{{b}} {{a}}\n{{#c}}\n{{a}}\n{{/c}}\n").unwrap();
        assert_eq!(t.variables(), vec!["a", "b", "c"]);
    }
}
