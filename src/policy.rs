//! Static policy filter.
//!
//! A lexical first line of defence: source text is split into dotted
//! identifier chains (`os.system`, `subprocess.run`) and compared against a
//! configured deny list. Comments and plain string literals are skipped;
//! the `{...}` fields of f-strings are scanned as code. Names bound by
//! import statements are resolved first, so `from os import system` and
//! `import os as o; o.system` are both seen as `os.system`.
//!
//! This is hygiene, not a security boundary. Names assembled at runtime
//! (`getattr(__builtins__, "ev" + "al")`) sail straight through; the
//! resource limits and process isolation in [`crate::runner`] are what
//! actually contain a hostile program.

use lazy_static::lazy_static;
use serde_derive::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};

use crate::config::SandboxConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    DynamicEvaluation,
    DynamicImport,
    ProcessSpawn,
    FileAccess,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::DynamicEvaluation => "dynamic evaluation",
            Category::DynamicImport => "dynamic import",
            Category::ProcessSpawn => "process spawning",
            Category::FileAccess => "raw file access",
        };
        f.write_str(name)
    }
}

/// One deny-list entry: a dotted identifier and why it is refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForbiddenPattern {
    pub name: String,
    pub category: Category,
}

impl ForbiddenPattern {
    pub fn new(name: impl Into<String>, category: Category) -> Self {
        ForbiddenPattern {
            name: name.into(),
            category,
        }
    }
}

lazy_static! {
    pub static ref DEFAULT_DENYLIST: Vec<ForbiddenPattern> = {
        use Category::*;

        let table: &[(&[&str], Category)] = &[
            (&["eval", "exec", "compile"], DynamicEvaluation),
            (&["__import__", "importlib"], DynamicImport),
            (
                &[
                    "subprocess", "pty", "os.system", "os.popen", "os.fork", "os.forkpty",
                    "os.execl", "os.execle", "os.execlp", "os.execlpe", "os.execv",
                    "os.execve", "os.execvp", "os.execvpe", "os.spawnl", "os.spawnle",
                    "os.spawnlp", "os.spawnlpe", "os.spawnv", "os.spawnve", "os.spawnvp",
                    "os.spawnvpe", "os.posix_spawn", "os.posix_spawnp",
                ],
                ProcessSpawn,
            ),
            (&["open", "io.open", "os.open", "os.fdopen"], FileAccess),
        ];

        table
            .iter()
            .flat_map(|(names, category)| {
                names.iter().map(move |name| ForbiddenPattern::new(*name, *category))
            })
            .collect()
    };
}

/// Why a request was refused before anything was spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PolicyViolation {
    ForbiddenToken {
        token: String,
        category: Category,
        /// Byte offset into the submitted source.
        offset: usize,
        line: usize,
        column: usize,
    },
    CodeTooLarge {
        size: usize,
        limit: usize,
    },
}

impl PolicyViolation {
    pub fn reason(&self) -> String {
        match self {
            PolicyViolation::ForbiddenToken {
                token,
                category,
                line,
                column,
                ..
            } => format!(
                "Code contains restricted operation `{}` ({}) at line {}, column {}",
                token, category, line, column
            ),
            PolicyViolation::CodeTooLarge { size, limit } => format!(
                "Code is {} bytes, above the {} byte limit",
                size, limit
            ),
        }
    }
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    name: String,
    category: Category,
    segments: Vec<String>,
}

impl CompiledPattern {
    fn matches(&self, chain: &[&str]) -> bool {
        self.segments.len() <= chain.len()
            && self.segments.iter().zip(chain).all(|(want, got)| want == got)
    }
}

/// Deterministic, side-effect free source check.
#[derive(Debug, Clone)]
pub struct PolicyFilter {
    patterns: Vec<CompiledPattern>,
    max_source_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
struct Hit {
    offset: usize,
    pattern: usize,
}

#[derive(Debug, Default)]
struct Chain<'a> {
    start: usize,
    segments: Vec<&'a str>,
    // Chains reached through `.` on a call or literal are attribute
    // lookups on some other object and are never checked.
    attribute: bool,
    pending_dot: bool,
}

impl PolicyFilter {
    pub fn new(patterns: &[ForbiddenPattern], max_source_bytes: usize) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| {
                let segments: Vec<String> = p
                    .name
                    .split('.')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
                if segments.is_empty() {
                    log::warn!("Ignoring empty forbidden pattern {:?}", p.name);
                    return None;
                }
                Some(CompiledPattern {
                    name: segments.join("."),
                    category: p.category,
                    segments,
                })
            })
            .collect();

        PolicyFilter {
            patterns,
            max_source_bytes,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(&config.forbidden, config.max_source_bytes)
    }

    /// `None` means the source may be executed.
    pub fn check(&self, code: &str) -> Option<PolicyViolation> {
        if code.len() > self.max_source_bytes {
            return Some(PolicyViolation::CodeTooLarge {
                size: code.len(),
                limit: self.max_source_bytes,
            });
        }

        let imports = Imports::collect(code);
        let imported = imports
            .members
            .iter()
            .filter_map(|(offset, path)| {
                self.best_match(path).map(|pattern| Hit {
                    offset: *offset,
                    pattern,
                })
            })
            .min_by_key(|hit| hit.offset);

        let hit = match (self.scan(code, 0, &imports), imported) {
            (Some(a), Some(b)) => {
                if a.offset <= b.offset {
                    a
                } else {
                    b
                }
            }
            (a, b) => a.or(b)?,
        };
        let pattern = &self.patterns[hit.pattern];
        let (line, column) = line_and_column(code, hit.offset);

        Some(PolicyViolation::ForbiddenToken {
            token: pattern.name.clone(),
            category: pattern.category,
            offset: hit.offset,
            line,
            column,
        })
    }

    fn scan<'s>(&self, src: &'s str, base: usize, imports: &Imports<'s>) -> Option<Hit> {
        let bytes = src.as_bytes();
        let mut chain = Chain::default();
        let mut i = 0;

        while i < bytes.len() {
            let c = bytes[i];

            if c == b'#' {
                if let Some(hit) = self.close(&mut chain, imports) {
                    return Some(hit);
                }
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            } else if c == b'\'' || c == b'"' {
                if let Some(hit) = self.close(&mut chain, imports) {
                    return Some(hit);
                }
                i = skip_string(bytes, i).end;
            } else if is_ident_start(c) {
                let start = i;
                while i < bytes.len() && is_ident_continue(bytes[i]) {
                    i += 1;
                }
                let ident = &src[start..i];

                if i < bytes.len() && is_quote(bytes[i]) && is_string_prefix(ident) {
                    if let Some(hit) = self.close(&mut chain, imports) {
                        return Some(hit);
                    }
                    let literal = skip_string(bytes, i);
                    if ident.contains(|ch| ch == 'f' || ch == 'F') {
                        if let Some(hit) = self.scan_fstring(src, &literal, base, imports) {
                            return Some(hit);
                        }
                    }
                    i = literal.end;
                    continue;
                }

                if chain.pending_dot && !chain.segments.is_empty() {
                    chain.segments.push(ident);
                    chain.pending_dot = false;
                } else {
                    let attribute = chain.pending_dot;
                    if let Some(hit) = self.close(&mut chain, imports) {
                        return Some(hit);
                    }
                    chain.start = base + start;
                    chain.segments.push(ident);
                    chain.attribute = attribute;
                }
            } else if c.is_ascii_digit() {
                if let Some(hit) = self.close(&mut chain, imports) {
                    return Some(hit);
                }
                while i < bytes.len() && (is_ident_continue(bytes[i]) || bytes[i] == b'.') {
                    i += 1;
                }
            } else if c == b'.' {
                if chain.pending_dot {
                    if let Some(hit) = self.close(&mut chain, imports) {
                        return Some(hit);
                    }
                }
                chain.pending_dot = true;
                i += 1;
            } else if c.is_ascii_whitespace() || c == b'\\' {
                i += 1;
            } else {
                if let Some(hit) = self.close(&mut chain, imports) {
                    return Some(hit);
                }
                i += 1;
            }
        }

        self.close(&mut chain, imports)
    }

    fn scan_fstring<'s>(
        &self,
        src: &'s str,
        literal: &Literal,
        base: usize,
        imports: &Imports<'s>,
    ) -> Option<Hit> {
        let bytes = src.as_bytes();
        let mut j = literal.body_start;

        while j < literal.body_end {
            if bytes[j] != b'{' {
                j += 1;
                continue;
            }
            if j + 1 < literal.body_end && bytes[j + 1] == b'{' {
                j += 2;
                continue;
            }

            let inner_start = j + 1;
            let mut k = inner_start;
            let mut depth = 1;
            while k < literal.body_end {
                match bytes[k] {
                    b'{' => depth += 1,
                    b'}' => depth -= 1,
                    _ => {}
                }
                if depth == 0 {
                    break;
                }
                k += 1;
            }

            if let Some(hit) = self.scan(&src[inner_start..k], base + inner_start, imports) {
                return Some(hit);
            }
            j = k + 1;
        }

        None
    }

    fn close<'s>(&self, chain: &mut Chain<'s>, imports: &Imports<'s>) -> Option<Hit> {
        let hit = if chain.attribute || chain.segments.is_empty() {
            None
        } else {
            self.resolve(&chain.segments, imports).map(|pattern| Hit {
                offset: chain.start,
                pattern,
            })
        };

        chain.segments.clear();
        chain.attribute = false;
        chain.pending_dot = false;
        hit
    }

    /// Checks the chain as written and as every import binding expands it.
    fn resolve<'s>(&self, chain: &[&'s str], imports: &Imports<'s>) -> Option<usize> {
        let mut candidates = vec![chain.to_vec()];
        if let Some(target) = imports.aliases.get(chain[0]) {
            candidates.push(target.iter().chain(&chain[1..]).copied().collect());
        }
        for module in &imports.star {
            candidates.push(module.iter().chain(chain).copied().collect());
        }

        candidates
            .iter()
            .filter_map(|candidate| self.best_match(candidate))
            .max_by_key(|&idx| self.patterns[idx].segments.len())
    }

    /// The most specific pattern matching `chain`.
    fn best_match(&self, chain: &[&str]) -> Option<usize> {
        self.patterns
            .iter()
            .enumerate()
            .filter(|(_, p)| p.matches(chain))
            .max_by_key(|(_, p)| p.segments.len())
            .map(|(idx, _)| idx)
    }
}

/// Names bound by `import` statements anywhere in the source.
#[derive(Debug, Default)]
struct Imports<'s> {
    /// Bound name to the dotted path it stands for.
    aliases: HashMap<&'s str, Vec<&'s str>>,
    /// Modules pulled in with `from m import *`.
    star: Vec<Vec<&'s str>>,
    /// Every `from m import n` as the offset of `n` and the path `m.n`.
    members: Vec<(usize, Vec<&'s str>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'s> {
    Name(&'s str, usize),
    Dot,
    Comma,
    Star,
    Open,
    Close,
    End,
    Other,
}

impl<'s> Imports<'s> {
    fn collect(src: &'s str) -> Self {
        let tokens = tokenize(src);
        let mut imports = Imports::default();
        let mut i = 0;
        while i < tokens.len() {
            i = match tokens[i] {
                Token::Name("import", _) => imports.plain(&tokens, i + 1),
                Token::Name("from", _) => imports.from(&tokens, i + 1),
                _ => i + 1,
            };
        }
        imports
    }

    /// `import a.b as c, d`
    fn plain(&mut self, tokens: &[Token<'s>], mut i: usize) -> usize {
        loop {
            let (path, next) = dotted(tokens, i);
            if path.is_empty() {
                return next;
            }
            i = next;
            if let (Some(Token::Name("as", _)), Some(Token::Name(alias, _))) =
                (tokens.get(i), tokens.get(i + 1))
            {
                self.bind(*alias, path);
                i += 2;
            }
            if tokens.get(i) != Some(&Token::Comma) {
                return i;
            }
            i += 1;
        }
    }

    /// `from a.b import (c as d, e)` and `from a import *`
    fn from(&mut self, tokens: &[Token<'s>], mut i: usize) -> usize {
        let mut relative = false;
        while tokens.get(i) == Some(&Token::Dot) {
            relative = true;
            i += 1;
        }
        let (module, next) = dotted(tokens, i);
        i = next;
        if !matches!(tokens.get(i), Some(Token::Name("import", _))) {
            // `yield from x`, `raise E from e`
            return i;
        }
        i += 1;
        if tokens.get(i) == Some(&Token::Open) {
            i += 1;
        }
        if tokens.get(i) == Some(&Token::Star) {
            if !relative && !module.is_empty() {
                self.star.push(module);
            }
            return i + 1;
        }

        while let Some(Token::Name(name, offset)) = tokens.get(i).copied() {
            let mut path = module.clone();
            path.push(name);
            i += 1;

            let bound = match (tokens.get(i), tokens.get(i + 1)) {
                (Some(Token::Name("as", _)), Some(Token::Name(alias, _))) => {
                    i += 2;
                    *alias
                }
                _ => name,
            };
            if !relative && !module.is_empty() {
                self.members.push((offset, path.clone()));
                self.bind(bound, path);
            }

            if tokens.get(i) != Some(&Token::Comma) {
                break;
            }
            i += 1;
        }
        i
    }

    fn bind(&mut self, name: &'s str, path: Vec<&'s str>) {
        if path.len() == 1 && path[0] == name {
            return;
        }
        self.aliases.insert(name, path);
    }
}

fn dotted<'s>(tokens: &[Token<'s>], mut i: usize) -> (Vec<&'s str>, usize) {
    let mut path = Vec::new();
    while let Some(Token::Name(name, _)) = tokens.get(i).copied() {
        path.push(name);
        i += 1;
        match (tokens.get(i), tokens.get(i + 1)) {
            (Some(Token::Dot), Some(Token::Name(..))) => i += 1,
            _ => break,
        }
    }
    (path, i)
}

/// Coarse tokens for import statements only; literals collapse to `Other`.
fn tokenize(src: &str) -> Vec<Token<'_>> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c == b'#' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if is_quote(c) {
            i = skip_string(bytes, i).end;
            tokens.push(Token::Other);
        } else if is_ident_start(c) {
            let start = i;
            while i < bytes.len() && is_ident_continue(bytes[i]) {
                i += 1;
            }
            let ident = &src[start..i];
            if i < bytes.len() && is_quote(bytes[i]) && is_string_prefix(ident) {
                i = skip_string(bytes, i).end;
                tokens.push(Token::Other);
            } else {
                tokens.push(Token::Name(ident, start));
            }
        } else if c.is_ascii_digit() {
            while i < bytes.len() && (is_ident_continue(bytes[i]) || bytes[i] == b'.') {
                i += 1;
            }
            tokens.push(Token::Other);
        } else {
            match c {
                b'.' => tokens.push(Token::Dot),
                b',' => tokens.push(Token::Comma),
                b'*' => tokens.push(Token::Star),
                b'(' | b'[' | b'{' => {
                    depth += 1;
                    tokens.push(Token::Open);
                }
                b')' | b']' | b'}' => {
                    depth = depth.saturating_sub(1);
                    tokens.push(Token::Close);
                }
                b'\n' if depth == 0 => tokens.push(Token::End),
                b';' => tokens.push(Token::End),
                b'\\' if bytes.get(i + 1) == Some(&b'\n') => i += 1,
                _ if c.is_ascii_whitespace() => {}
                _ => tokens.push(Token::Other),
            }
            i += 1;
        }
    }

    tokens
}

struct Literal {
    body_start: usize,
    body_end: usize,
    end: usize,
}

fn skip_string(bytes: &[u8], open: usize) -> Literal {
    let quote = bytes[open];
    let triple = open + 2 < bytes.len() && bytes[open + 1] == quote && bytes[open + 2] == quote;
    let quote_len = if triple { 3 } else { 1 };
    let body_start = open + quote_len;

    let mut j = body_start;
    while j < bytes.len() {
        let c = bytes[j];
        if c == b'\\' {
            j += 2;
            continue;
        }
        if triple {
            if c == quote && j + 2 < bytes.len() && bytes[j + 1] == quote && bytes[j + 2] == quote
            {
                return Literal {
                    body_start,
                    body_end: j,
                    end: j + 3,
                };
            }
        } else if c == quote {
            return Literal {
                body_start,
                body_end: j,
                end: j + 1,
            };
        } else if c == b'\n' {
            // Unterminated single-line literal.
            return Literal {
                body_start,
                body_end: j,
                end: j,
            };
        }
        j += 1;
    }

    let end = bytes.len();
    Literal {
        body_start: body_start.min(end),
        body_end: end,
        end,
    }
}

fn is_quote(c: u8) -> bool {
    c == b'\'' || c == b'"'
}

fn is_string_prefix(ident: &str) -> bool {
    ident.len() <= 2 && ident.chars().all(|c| "rRbBuUfF".contains(c))
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c >= 0x80
}

fn is_ident_continue(c: u8) -> bool {
    is_ident_start(c) || c.is_ascii_digit()
}

fn line_and_column(code: &str, offset: usize) -> (usize, usize) {
    let before = &code[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |idx| idx + 1);
    let column = before[line_start..].chars().count() + 1;
    (line, column)
}

#[cfg(test)]
mod test {
    use super::*;

    fn filter() -> PolicyFilter {
        PolicyFilter::new(&DEFAULT_DENYLIST, 64 * 1024)
    }

    fn token_of(code: &str) -> Option<String> {
        match filter().check(code) {
            Some(PolicyViolation::ForbiddenToken { token, .. }) => Some(token),
            Some(other) => panic!("unexpected violation {:?}", other),
            None => None,
        }
    }

    #[test]
    fn hello_world_is_clean() {
        assert_eq!(filter().check("print('Hello, World!')"), None);
    }

    #[test]
    fn empty_code_is_clean() {
        assert_eq!(filter().check(""), None);
    }

    #[test]
    fn os_system_is_named() {
        let violation = filter()
            .check("import os; os.system('ls')")
            .expect("should be rejected");
        assert_eq!(
            violation,
            PolicyViolation::ForbiddenToken {
                token: "os.system".into(),
                category: Category::ProcessSpawn,
                offset: 11,
                line: 1,
                column: 12,
            }
        );
        assert!(violation.reason().contains("os.system"));
    }

    #[test]
    fn builtin_primitives_are_rejected() {
        assert_eq!(token_of("eval('1+1')"), Some("eval".into()));
        assert_eq!(token_of("x = exec(code)"), Some("exec".into()));
        assert_eq!(token_of("compile(src, 'f', 'exec')"), Some("compile".into()));
        assert_eq!(token_of("m = __import__('os')"), Some("__import__".into()));
        assert_eq!(token_of("with open('/etc/passwd') as f:\n    pass"), Some("open".into()));
    }

    #[test]
    fn module_prefix_matches_attribute_chains() {
        assert_eq!(token_of("import subprocess"), Some("subprocess".into()));
        assert_eq!(token_of("from subprocess import run"), Some("subprocess".into()));
        assert_eq!(token_of("subprocess.run(['ls'])"), Some("subprocess".into()));
        assert_eq!(token_of("import importlib.util"), Some("importlib".into()));
        assert_eq!(token_of("from os import system\nsystem('id')"), Some("os.system".into()));
        assert_eq!(token_of("import os as o\no.system('id')"), Some("os.system".into()));
    }

    #[test]
    fn imported_members_resolve_to_their_module() {
        let violation = filter()
            .check("from os import system\nsystem('echo pwned')")
            .expect("should be rejected");
        match violation {
            PolicyViolation::ForbiddenToken {
                token, line, column, ..
            } => {
                assert_eq!(token, "os.system");
                assert_eq!(line, 1);
                assert_eq!(column, 16);
            }
            other => panic!("unexpected violation {:?}", other),
        }

        assert_eq!(token_of("from io import open"), Some("io.open".into()));
        assert_eq!(token_of("from os import (path, popen as p)"), Some("os.popen".into()));
        assert_eq!(token_of("from os import *\nsystem('id')"), Some("os.system".into()));
    }

    #[test]
    fn module_aliases_are_followed() {
        assert_eq!(token_of("import os as o\no.system('id')"), Some("os.system".into()));
        assert_eq!(token_of("import sys, os as o; o.fork()"), Some("os.fork".into()));
        assert_eq!(token_of("x = o.fdopen(3)\nimport os as o"), Some("os.fdopen".into()));
    }

    #[test]
    fn harmless_imports_stay_clean() {
        for code in &[
            "from os import path\nprint(path.join('a', 'b'))",
            "import os.path as p\np.exists('x')",
            "import numpy as np\nnp.array([1])",
            "from . import helpers",
            "def gen():\n    yield from range(3)",
            "raise ValueError('x') from None",
            "from math import *\nprint(sqrt(4))",
        ] {
            assert_eq!(filter().check(code), None, "false positive on {:?}", code);
        }
    }

    #[test]
    fn whitespace_around_dots_does_not_hide_chain() {
        assert_eq!(token_of("os . system('id')"), Some("os.system".into()));
        assert_eq!(token_of("os.\\\n    popen('id')"), Some("os.popen".into()));
    }

    #[test]
    fn lookalike_identifiers_are_allowed() {
        for code in &[
            "evaluate = 3",
            "reopen = True",
            "my_open(x)",
            "execute()",
            "compiled = []",
            "opener.open()",
            "re.compile('a+')",
            "os.path.join('a', 'b')",
            "def evaluation(): pass",
        ] {
            assert_eq!(filter().check(code), None, "false positive on {:?}", code);
        }
    }

    #[test]
    fn attribute_lookup_on_expression_is_not_a_builtin() {
        assert_eq!(filter().check("get_file().open()"), None);
        assert_eq!(filter().check("'abc'.format(1)"), None);
        assert_eq!(filter().check("items[0].eval()"), None);
    }

    #[test]
    fn comments_and_strings_are_skipped() {
        assert_eq!(filter().check("# eval(x)\nprint(1)"), None);
        assert_eq!(filter().check("print('open the door')"), None);
        assert_eq!(filter().check("print(\"subprocess\")"), None);
        assert_eq!(filter().check("s = '''\nexec\n'''"), None);
        assert_eq!(filter().check("s = 'it\\'s eval'"), None);
        assert_eq!(filter().check("b = rb'open'"), None);
    }

    #[test]
    fn fstring_fields_are_scanned() {
        assert_eq!(token_of("print(f'{eval(\"1\")}')"), Some("eval".into()));
        assert_eq!(filter().check("print(f'open {x} {{eval}}')"), None);
    }

    #[test]
    fn first_violation_in_source_order_wins() {
        let violation = filter()
            .check("x = 1\nopen('a')\neval('b')")
            .expect("should be rejected");
        match violation {
            PolicyViolation::ForbiddenToken {
                token, line, column, ..
            } => {
                assert_eq!(token, "open");
                assert_eq!(line, 2);
                assert_eq!(column, 1);
            }
            other => panic!("unexpected violation {:?}", other),
        }
    }

    #[test]
    fn most_specific_pattern_is_reported() {
        let patterns = vec![
            ForbiddenPattern::new("os", Category::FileAccess),
            ForbiddenPattern::new("os.system", Category::ProcessSpawn),
        ];
        let filter = PolicyFilter::new(&patterns, 1024);
        match filter.check("os.system('ls')") {
            Some(PolicyViolation::ForbiddenToken {
                token, category, ..
            }) => {
                assert_eq!(token, "os.system");
                assert_eq!(category, Category::ProcessSpawn);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn oversized_code_is_rejected_before_scanning() {
        let filter = PolicyFilter::new(&DEFAULT_DENYLIST, 16);
        assert_eq!(
            filter.check("print('this is far too long')"),
            Some(PolicyViolation::CodeTooLarge { size: 29, limit: 16 })
        );
    }

    #[test]
    fn check_is_deterministic() {
        let code = "import os\nprint(os.getcwd())\nos.popen('x')";
        let first = filter().check(code);
        for _ in 0..10 {
            assert_eq!(filter().check(code), first);
        }
    }

    #[test]
    fn deny_list_is_configurable() {
        let filter = PolicyFilter::new(&[ForbiddenPattern::new("socket", Category::FileAccess)], 1024);
        assert_eq!(filter.check("eval('1')"), None);
        assert!(filter.check("import socket").is_some());
    }

    #[test]
    fn column_counts_characters_not_bytes() {
        let violation = filter().check("é = 1; eval('x')").expect("should be rejected");
        match violation {
            PolicyViolation::ForbiddenToken { offset, column, .. } => {
                assert_eq!(offset, 8);
                assert_eq!(column, 8);
            }
            other => panic!("unexpected violation {:?}", other),
        }
    }
}
