//! Dependency extraction
//!
//! Finds capability references in skill source by walking the token stream,
//! so text inside strings and comments never counts and calls split across
//! bracketed continuation lines are seen once.

use std::collections::{HashMap, HashSet};

use super::syntax::{lex, Token, TokenKind};
use super::types::CapabilityRef;

/// Root package of the generated API surface
const API_PACKAGE: &str = "servers";

/// What an imported name refers to
#[derive(Debug, Clone)]
enum Binding {
    /// `from servers.S.T import f` binds a wrapper function
    Function(CapabilityRef),
    /// A tool module: `m.f(...)` is a call of S.T
    Tool(CapabilityRef),
    /// A server package: `m.T.f(...)`
    Server(String),
    /// The `servers` package itself: `servers.S.T.f(...)`
    Root,
}

/// Capability references in first-occurrence order, deduplicated
pub fn extract_dependencies(source: &str) -> Vec<CapabilityRef> {
    let lexed = lex(source);
    let statements = split_statements(&lexed.tokens);

    let mut bindings = HashMap::new();
    for stmt in &statements {
        collect_imports(stmt, &mut bindings);
    }

    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for stmt in &statements {
        if is_import(stmt) {
            continue;
        }
        for cap in calls_in(stmt, &bindings) {
            if seen.insert(cap.clone()) {
                found.push(cap);
            }
        }
    }
    found
}

fn split_statements(tokens: &[Token]) -> Vec<Vec<&TokenKind>> {
    let mut statements = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0usize;
    for token in tokens {
        match &token.kind {
            TokenKind::Newline => {
                statements.push(std::mem::take(&mut current));
                depth = 0;
            }
            TokenKind::Op(';') if depth == 0 => {
                statements.push(std::mem::take(&mut current));
            }
            kind => {
                match kind {
                    TokenKind::Op('(') | TokenKind::Op('[') | TokenKind::Op('{') => depth += 1,
                    TokenKind::Op(')') | TokenKind::Op(']') | TokenKind::Op('}') => {
                        depth = depth.saturating_sub(1)
                    }
                    _ => {}
                }
                current.push(kind);
            }
        }
    }
    if !current.is_empty() {
        statements.push(current);
    }
    statements
}

fn name(kind: &TokenKind) -> Option<&str> {
    match kind {
        TokenKind::Name(n) => Some(n.as_str()),
        _ => None,
    }
}

fn is_import(stmt: &[&TokenKind]) -> bool {
    matches!(stmt.first().and_then(|k| name(k)), Some("import") | Some("from"))
}

/// Parse `a.b.c` starting at `i`; returns the parts and the next index
fn dotted(stmt: &[&TokenKind], mut i: usize) -> (Vec<String>, usize) {
    let mut parts = Vec::new();
    while let Some(part) = stmt.get(i).and_then(|k| name(k)) {
        parts.push(part.to_string());
        i += 1;
        if stmt.get(i) == Some(&&TokenKind::Op('.')) {
            i += 1;
        } else {
            break;
        }
    }
    (parts, i)
}

/// Optional `as alias` at `i`
fn alias(stmt: &[&TokenKind], i: usize) -> (Option<String>, usize) {
    if stmt.get(i).and_then(|k| name(k)) == Some("as") {
        if let Some(a) = stmt.get(i + 1).and_then(|k| name(k)) {
            return (Some(a.to_string()), i + 2);
        }
    }
    (None, i)
}

fn module_binding(path: &[String]) -> Option<Binding> {
    if path.first().map(String::as_str) != Some(API_PACKAGE) {
        return None;
    }
    match path.len() {
        1 => Some(Binding::Root),
        2 => Some(Binding::Server(path[1].clone())),
        3 => Some(Binding::Tool(CapabilityRef::new(&path[1], &path[2]))),
        _ => None,
    }
}

fn collect_imports(stmt: &[&TokenKind], bindings: &mut HashMap<String, Binding>) {
    match stmt.first().and_then(|k| name(k)) {
        Some("import") => {
            let mut i = 1;
            while i < stmt.len() {
                let (path, next) = dotted(stmt, i);
                if path.is_empty() {
                    break;
                }
                let (as_name, next) = alias(stmt, next);
                match as_name {
                    Some(a) => {
                        if let Some(binding) = module_binding(&path) {
                            bindings.insert(a, binding);
                        }
                    }
                    // `import servers.x.y` binds only the top-level package
                    None if path[0] == API_PACKAGE => {
                        bindings.insert(API_PACKAGE.to_string(), Binding::Root);
                    }
                    None => {}
                }
                i = next;
                if stmt.get(i) == Some(&&TokenKind::Op(',')) {
                    i += 1;
                } else {
                    break;
                }
            }
        }
        Some("from") => {
            let (module, mut i) = dotted(stmt, 1);
            if module.first().map(String::as_str) != Some(API_PACKAGE)
                || stmt.get(i).and_then(|k| name(k)) != Some("import")
            {
                return;
            }
            i += 1;
            while i < stmt.len() {
                match stmt[i] {
                    TokenKind::Op('(') | TokenKind::Op(')') | TokenKind::Op(',') => {
                        i += 1;
                        continue;
                    }
                    TokenKind::Name(imported) => {
                        let (as_name, next) = alias(stmt, i + 1);
                        let bound = as_name.unwrap_or_else(|| imported.clone());
                        let mut full = module.clone();
                        full.push(imported.clone());
                        let binding = match full.len() {
                            4 => Some(Binding::Function(CapabilityRef::new(&full[1], &full[2]))),
                            _ => module_binding(&full),
                        };
                        if let Some(binding) = binding {
                            bindings.insert(bound, binding);
                        }
                        i = next;
                    }
                    _ => break,
                }
            }
        }
        _ => {}
    }
}

fn string_arg(kind: Option<&&TokenKind>) -> Option<String> {
    match kind {
        Some(TokenKind::Str { prefix, body }) if !prefix.to_ascii_lowercase().contains('f') => {
            Some(body.clone())
        }
        _ => None,
    }
}

fn calls_in(stmt: &[&TokenKind], bindings: &HashMap<String, Binding>) -> Vec<CapabilityRef> {
    let mut found = Vec::new();
    let mut i = 0;
    while i < stmt.len() {
        let starts_chain = name(stmt[i]).is_some()
            && (i == 0 || stmt[i - 1] != &TokenKind::Op('.'))
            && !matches!(
                i.checked_sub(1).and_then(|p| name(stmt[p])),
                Some("def") | Some("class")
            );
        if !starts_chain {
            i += 1;
            continue;
        }

        let (chain, next) = dotted(stmt, i);
        if stmt.get(next) != Some(&&TokenKind::Op('(')) {
            i = next.max(i + 1);
            continue;
        }

        if chain.last().map(String::as_str) == Some("mcp_call") {
            let server = string_arg(stmt.get(next + 1));
            let comma = stmt.get(next + 2) == Some(&&TokenKind::Op(','));
            let tool = string_arg(stmt.get(next + 3));
            if let (Some(server), true, Some(tool)) = (server, comma, tool) {
                found.push(CapabilityRef::new(server, tool));
            }
        } else if let Some(binding) = bindings.get(&chain[0]) {
            let cap = match (binding, chain.len()) {
                (Binding::Function(cap), 1) => Some(cap.clone()),
                (Binding::Tool(cap), 2) => Some(cap.clone()),
                (Binding::Server(server), 3) => Some(CapabilityRef::new(server, &chain[1])),
                (Binding::Root, 4) => Some(CapabilityRef::new(&chain[1], &chain[2])),
                _ => None,
            };
            found.extend(cap);
        }
        i = next + 1;
    }
    found
}
