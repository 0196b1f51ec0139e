//! Python Source Validation
//!
//! A small Python lexer shared by the store (write-time validation), the
//! materializer (rematerialization check) and the dependency extractor.
//!
//! The lexical check catches what a lexer can see: unterminated strings,
//! unbalanced brackets, invalid characters and indentation structure.
//! [`SyntaxChecker::Interpreter`] additionally hands the source to the real
//! interpreter's parser.

use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Result, SkillError};

/// Token kinds produced by [`lex`]
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    /// String literal; `body` is the raw text between the quotes
    Str { prefix: String, body: String },
    Number,
    Op(char),
    /// End of a logical line
    Newline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

/// A syntax problem found while lexing
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxIssue {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for SyntaxIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

#[derive(Debug, Clone)]
struct LogicalLine {
    line: usize,
    indent: usize,
    ends_with_colon: bool,
}

/// Lexer output
#[derive(Debug, Clone, Default)]
pub struct Lexed {
    pub tokens: Vec<Token>,
    pub issues: Vec<SyntaxIssue>,
    lines: Vec<LogicalLine>,
}

const STRING_PREFIXES: &[&str] = &["r", "u", "b", "f", "br", "rb", "fr", "rf"];

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    brackets: Vec<(char, usize)>,
    at_line_start: bool,
    open_line: Option<LogicalLine>,
    out: Lexed,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            brackets: Vec::new(),
            at_line_start: true,
            open_line: None,
            out: Lexed::default(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn issue(&mut self, line: usize, message: impl Into<String>) {
        self.out.issues.push(SyntaxIssue {
            line,
            message: message.into(),
        });
    }

    fn push(&mut self, kind: TokenKind) {
        if let Some(open) = self.open_line.as_mut() {
            open.ends_with_colon = kind == TokenKind::Op(':');
        }
        self.out.tokens.push(Token {
            kind,
            line: self.line,
        });
    }

    fn end_logical_line(&mut self) {
        if let Some(open) = self.open_line.take() {
            self.out.tokens.push(Token {
                kind: TokenKind::Newline,
                line: self.line,
            });
            self.out.lines.push(open);
        }
    }

    /// Measure indentation at the start of a physical line. Returns false for
    /// blank and comment-only lines, which do not open a logical line.
    fn begin_line(&mut self) -> bool {
        let mut indent = 0;
        while let Some(c) = self.peek(0) {
            match c {
                ' ' => indent += 1,
                '\t' => indent = (indent / 8 + 1) * 8,
                '\x0c' => indent = 0,
                _ => break,
            }
            self.pos += 1;
        }
        match self.peek(0) {
            None | Some('\n') | Some('\r') | Some('#') => false,
            Some(_) => {
                self.open_line = Some(LogicalLine {
                    line: self.line,
                    indent,
                    ends_with_colon: false,
                });
                self.at_line_start = false;
                true
            }
        }
    }

    fn run(mut self) -> Lexed {
        loop {
            if self.at_line_start && self.brackets.is_empty() && !self.begin_line() {
                // Blank or comment-only line: skip to the newline.
                while let Some(c) = self.peek(0) {
                    if c == '\n' {
                        break;
                    }
                    self.pos += 1;
                }
                if self.peek(0).is_none() {
                    break;
                }
                self.pos += 1;
                self.line += 1;
                continue;
            }

            let Some(c) = self.peek(0) else { break };
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.brackets.is_empty() {
                        self.end_logical_line();
                        self.at_line_start = true;
                    }
                    self.line += 1;
                }
                '\\' if matches!(self.peek(1), Some('\n')) => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\\' if self.peek(1) == Some('\r') && self.peek(2) == Some('\n') => {
                    self.pos += 3;
                    self.line += 1;
                }
                '#' => {
                    while let Some(c) = self.peek(0) {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '"' | '\'' => self.string(String::new()),
                c if c.is_alphabetic() || c == '_' => self.name_or_prefixed_string(),
                c if c.is_ascii_digit() => self.number(),
                '.' if self.peek(1).is_some_and(|n| n.is_ascii_digit()) => self.number(),
                '(' | '[' | '{' => {
                    self.brackets.push((c, self.line));
                    self.pos += 1;
                    self.push(TokenKind::Op(c));
                }
                ')' | ']' | '}' => {
                    self.pos += 1;
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match self.brackets.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, open_line)) => {
                            let line = self.line;
                            self.issue(
                                line,
                                format!(
                                    "closing parenthesis '{}' does not match opening parenthesis '{}' on line {}",
                                    c, open, open_line
                                ),
                            );
                        }
                        None => {
                            let line = self.line;
                            self.issue(line, format!("unmatched '{}'", c));
                        }
                    }
                    self.push(TokenKind::Op(c));
                }
                '$' | '?' | '`' => {
                    let line = self.line;
                    self.issue(line, format!("invalid character '{}'", c));
                    self.pos += 1;
                }
                _ => {
                    self.pos += 1;
                    self.push(TokenKind::Op(c));
                }
            }
        }

        self.end_logical_line();
        for (open, line) in std::mem::take(&mut self.brackets) {
            self.issue(line, format!("'{}' was never closed", open));
        }
        self.out
    }

    fn name_or_prefixed_string(&mut self) {
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        if matches!(self.peek(0), Some('"') | Some('\''))
            && STRING_PREFIXES.contains(&word.to_ascii_lowercase().as_str())
        {
            self.string(word);
        } else {
            self.push(TokenKind::Name(word));
        }
    }

    fn number(&mut self) {
        let mut prev = '\0';
        while let Some(c) = self.peek(0) {
            let exponent_sign = (c == '+' || c == '-') && (prev == 'e' || prev == 'E');
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || exponent_sign {
                prev = c;
                self.pos += 1;
            } else {
                break;
            }
        }
        self.push(TokenKind::Number);
    }

    fn string(&mut self, prefix: String) {
        let start_line = self.line;
        let Some(quote) = self.peek(0) else { return };
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut body = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                let what = if triple {
                    "unterminated triple-quoted string literal"
                } else {
                    "unterminated string literal"
                };
                self.issue(start_line, what);
                break;
            };
            if c == '\\' {
                body.push(c);
                self.pos += 1;
                if let Some(next) = self.peek(0) {
                    if next == '\n' {
                        self.line += 1;
                    }
                    body.push(next);
                    self.pos += 1;
                }
                continue;
            }
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }
            if c == '\n' {
                if !triple {
                    self.issue(start_line, "unterminated string literal");
                    break;
                }
                self.line += 1;
            }
            body.push(c);
            self.pos += 1;
        }

        let token = Token {
            kind: TokenKind::Str { prefix, body },
            line: start_line,
        };
        if let Some(open) = self.open_line.as_mut() {
            open.ends_with_colon = false;
        }
        self.out.tokens.push(token);
    }
}

/// Tokenize Python source. Never fails; problems are collected in `issues`.
pub fn lex(source: &str) -> Lexed {
    Lexer::new(source).run()
}

fn indentation_issues(lines: &[LogicalLine]) -> Vec<SyntaxIssue> {
    let mut issues = Vec::new();
    let mut stack = vec![0usize];
    let mut expect_block = false;

    for ll in lines {
        let top = *stack.last().unwrap_or(&0);
        if ll.indent > top {
            if !expect_block {
                issues.push(SyntaxIssue {
                    line: ll.line,
                    message: "unexpected indent".to_string(),
                });
            }
            stack.push(ll.indent);
        } else {
            if expect_block {
                issues.push(SyntaxIssue {
                    line: ll.line,
                    message: "expected an indented block".to_string(),
                });
            }
            while stack.len() > 1 && ll.indent < *stack.last().unwrap_or(&0) {
                stack.pop();
            }
            if ll.indent != *stack.last().unwrap_or(&0) {
                issues.push(SyntaxIssue {
                    line: ll.line,
                    message: "unindent does not match any outer indentation level".to_string(),
                });
            }
        }
        expect_block = ll.ends_with_colon;
    }

    if expect_block {
        let line = lines.last().map(|l| l.line).unwrap_or(1);
        issues.push(SyntaxIssue {
            line,
            message: "expected an indented block at end of input".to_string(),
        });
    }
    issues
}

/// Lexical syntax check: strings, brackets, characters, indentation
pub fn check_syntax(source: &str) -> std::result::Result<(), SyntaxIssue> {
    let lexed = lex(source);
    let mut issues = lexed.issues;
    issues.extend(indentation_issues(&lexed.lines));
    match issues.into_iter().min_by_key(|i| i.line) {
        Some(first) => Err(first),
        None => Ok(()),
    }
}

/// Module docstring, cleaned like `inspect.cleandoc`; empty when absent
pub fn extract_docstring(source: &str) -> String {
    let lexed = lex(source);
    let mut parts = Vec::new();
    for token in &lexed.tokens {
        match &token.kind {
            TokenKind::Str { prefix, body } => {
                let p = prefix.to_ascii_lowercase();
                if p.contains('f') || p.contains('b') {
                    return String::new();
                }
                parts.push(body.as_str());
            }
            TokenKind::Newline => break,
            _ => return String::new(),
        }
    }
    clean_docstring(&parts.concat())
}

fn clean_docstring(doc: &str) -> String {
    let expanded = doc.replace('\t', "        ");
    let mut lines: Vec<&str> = expanded.lines().collect();
    if lines.is_empty() {
        return String::new();
    }

    let margin = lines[1..]
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    let mut cleaned: Vec<String> = Vec::with_capacity(lines.len());
    cleaned.push(lines.remove(0).trim_start().to_string());
    for line in lines {
        cleaned.push(line.get(margin..).unwrap_or("").trim_end().to_string());
    }

    while cleaned.first().is_some_and(|l| l.trim().is_empty()) {
        cleaned.remove(0);
    }
    while cleaned.last().is_some_and(|l| l.trim().is_empty()) {
        cleaned.pop();
    }
    cleaned.join("\n")
}

static TRACEBACK_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"File "<skill>", line (\d+)"#).expect("static regex"));

// compile, not ast.parse: module-level `return` and stray `break` must fail
const COMPILE_SNIPPET: &str =
    "import sys\ncompile(sys.stdin.read(), '<skill>', 'exec', dont_inherit=True)\n";

/// Write-time source validation strategy
#[derive(Debug, Clone)]
pub enum SyntaxChecker {
    /// Lexer-level check only
    Lexical,
    /// Lexical check, then the interpreter's own compiler
    Interpreter { program: String, timeout: Duration },
}

impl Default for SyntaxChecker {
    fn default() -> Self {
        Self::Lexical
    }
}

impl SyntaxChecker {
    pub fn interpreter(program: impl Into<String>) -> Self {
        Self::Interpreter {
            program: program.into(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Reject source that is not valid Python
    pub fn check(&self, source: &str) -> Result<()> {
        check_syntax(source)
            .map_err(|issue| SkillError::Validation(format!("syntax error at {}", issue)))?;

        match self {
            Self::Lexical => Ok(()),
            Self::Interpreter { program, timeout } => {
                match parse_with_interpreter(program, source, *timeout) {
                    Ok(None) => Ok(()),
                    Ok(Some(message)) => Err(SkillError::Validation(message)),
                    Err(e) => {
                        // Interpreter missing or hung: the lexical verdict stands.
                        warn!("Interpreter syntax check unavailable ({}): {}", program, e);
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Ok(None) when the source parses, Ok(Some(msg)) on a syntax error
fn parse_with_interpreter(
    program: &str,
    source: &str,
    timeout: Duration,
) -> std::io::Result<Option<String>> {
    let mut child = Command::new(program)
        .arg("-I")
        .arg("-c")
        .arg(COMPILE_SNIPPET)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(source.as_bytes())?;
    }

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "syntax check timed out",
            ));
        }
        std::thread::sleep(Duration::from_millis(5));
    };

    if status.success() {
        return Ok(None);
    }

    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        pipe.read_to_string(&mut stderr)?;
    }
    debug!("Interpreter rejected source: {}", stderr.trim());

    let line = TRACEBACK_LINE
        .captures_iter(&stderr)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let summary = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("SyntaxError")
        .trim()
        .to_string();

    Ok(Some(match line {
        Some(line) => format!("syntax error at line {}: {}", line, summary),
        None => format!("syntax error: {}", summary),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(source: &str) -> Vec<String> {
        lex(source)
            .tokens
            .into_iter()
            .filter_map(|t| match t.kind {
                TokenKind::Name(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_valid_source_passes() {
        let src = "\"\"\"Adds numbers.\"\"\"\n\ndef add_three(a, b, c):\n    # sum\n    total = (a +\n             b +\n             c)\n    return total\n\nresult = add_three(1, 2, 3)\n";
        assert!(check_syntax(src).is_ok());
    }

    #[test]
    fn test_unterminated_string() {
        let err = check_syntax("x = 'abc\ny = 1\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_unbalanced_brackets() {
        let err = check_syntax("x = foo(1, 2\n").unwrap_err();
        assert!(err.message.contains("never closed"));

        let err = check_syntax("x = [1, 2)\n").unwrap_err();
        assert!(err.message.contains("does not match"));
    }

    #[test]
    fn test_indentation_rules() {
        assert!(check_syntax("def f():\nreturn 1\n").is_err());
        assert!(check_syntax("x = 1\n    y = 2\n").is_err());
        assert!(check_syntax("if x:\n        a = 1\n    b = 2\n").is_err());
        assert!(check_syntax("def f():\n").is_err());
        assert!(check_syntax("if x: pass\nelse:\n    y = 2\n").is_ok());
    }

    #[test]
    fn test_comments_and_strings_hide_names() {
        let toks = names("# mcp_call here\nx = 'mcp_call'\ny = z\n");
        assert_eq!(toks, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_prefixed_and_triple_strings() {
        let lexed = lex("a = rb'\\d'\nb = f\"{x}\"\nc = '''multi\nline'''\nd = 1\n");
        assert!(lexed.issues.is_empty());
        let strs = lexed
            .tokens
            .iter()
            .filter(|t| matches!(t.kind, TokenKind::Str { .. }))
            .count();
        assert_eq!(strs, 3);
        let d_line = lexed
            .tokens
            .iter()
            .find(|t| t.kind == TokenKind::Name("d".into()))
            .map(|t| t.line);
        assert_eq!(d_line, Some(5));
    }

    #[test]
    fn test_docstring_extraction() {
        let src = "\"\"\"\n    Calculate sum of three numbers\n\n    Uses the calculator server.\n    \"\"\"\nimport json\n";
        assert_eq!(
            extract_docstring(src),
            "Calculate sum of three numbers\n\nUses the calculator server."
        );
        assert_eq!(extract_docstring("x = 1\n\"\"\"late\"\"\"\n"), "");
        assert_eq!(extract_docstring("f'not a doc'\n"), "");
        assert_eq!(extract_docstring("# only a comment\n'doc'\n"), "doc");
    }

    #[test]
    fn test_invalid_character() {
        assert!(check_syntax("x = $y\n").is_err());
        assert!(check_syntax("x = '$y'\n").is_ok());
    }

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_interpreter_rejects_compile_errors() {
        if !python_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let checker = SyntaxChecker::interpreter("python3");

        assert!(checker.check("def add(a, b):\n    return a + b\n").is_ok());
        for source in [
            "return 5\n",
            "x = 1\nbreak\n",
            "yield 1\n",
            "nonlocal x\n",
            "x = = 1\n",
        ] {
            let err = checker.check(source).unwrap_err();
            assert!(matches!(err, SkillError::Validation(_)), "{:?} accepted", source);
        }

        let err = checker.check("x = 1\nreturn x\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{}", err);
    }

    #[test]
    fn test_missing_interpreter_keeps_lexical_verdict() {
        let checker = SyntaxChecker::interpreter("skillforge-no-such-python");
        assert!(checker.check("x = 1\n").is_ok());
        assert!(checker.check("x = (1\n").is_err());
    }
}
