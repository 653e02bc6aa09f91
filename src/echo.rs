//! Interactive-style echo of a trailing expression.
//!
//! A snippet such as `5 + 1` prints nothing when run as a script. When the
//! final line is a bare, unindented expression it is rewritten so its value
//! is printed, the way an interactive prompt would show it. `None` results
//! stay silent.

const RESULT_BINDING: &str = "_sandbox_result";

const STATEMENT_KEYWORDS: &[&str] = &[
    "import", "from", "def", "class", "if", "elif", "else", "for", "while", "try", "except",
    "finally", "with", "return", "yield", "break", "continue", "pass", "raise", "assert", "del",
    "global", "nonlocal", "async", "await", "match", "case", "lambda",
];

/// Returns the code to hand to the interpreter.
pub fn prepare(code: &str) -> String {
    match split_trailing_expression(code) {
        Some((before, expression)) => {
            let mut prepared = String::with_capacity(code.len() + 64);
            prepared.push_str(before);
            if !before.is_empty() && !before.ends_with('\n') {
                prepared.push('\n');
            }
            prepared.push_str(&format!(
                "{binding} = {expr}\nif {binding} is not None:\n    print({binding})\n",
                binding = RESULT_BINDING,
                expr = expression
            ));
            prepared
        }
        None => code.to_string(),
    }
}

fn split_trailing_expression(code: &str) -> Option<(&str, &str)> {
    let trimmed = code.trim_end();
    if trimmed.is_empty() {
        return None;
    }

    let line_start = trimmed.rfind('\n').map_or(0, |idx| idx + 1);
    let last_line = &trimmed[line_start..];
    let before = &trimmed[..line_start];

    if last_line.starts_with(|c: char| c.is_whitespace()) {
        return None;
    }
    if !is_bare_expression(last_line.trim_end()) {
        return None;
    }
    // The last line must start a fresh logical line, outside any bracket
    // or multi-line string.
    if !is_complete(before) || before.trim_end().ends_with('\\') {
        return None;
    }

    Some((before, last_line.trim_end()))
}

fn is_bare_expression(line: &str) -> bool {
    if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
        return false;
    }
    if line.ends_with(':') || line.ends_with('\\') || line.contains(';') {
        return false;
    }
    if line.contains("print(") {
        return false;
    }

    let first_word: String = line
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if STATEMENT_KEYWORDS.contains(&first_word.as_str()) {
        return false;
    }

    !has_top_level_assignment(line) && is_complete(line)
}

/// True for `x = 1`, `x += 1`, `a, b = b, a`, `x: int = 1`; false for
/// comparisons and keyword arguments inside calls.
fn has_top_level_assignment(line: &str) -> bool {
    let bytes = line.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if let Some(q) = quote {
            if c == b'\\' {
                i += 1;
            } else if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match c {
            b'\'' | b'"' => quote = Some(c),
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b':' if depth == 0 => return true,
            b'=' if depth == 0 => {
                let prev = if i > 0 { bytes[i - 1] } else { b' ' };
                let next = bytes.get(i + 1).copied().unwrap_or(b' ');
                let comparison = next == b'=' || matches!(prev, b'=' | b'!' | b'<' | b'>');
                if !comparison {
                    return true;
                }
                if next == b'=' {
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    false
}

/// True when `code` ends outside every bracket and string literal.
/// Triple-quoted strings span lines; comments are ignored.
fn is_complete(code: &str) -> bool {
    let bytes = code.as_bytes();
    let mut depth = 0i32;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            quote @ (b'\'' | b'"') => match string_end(bytes, i, quote) {
                Some(end) => {
                    i = end;
                    continue;
                }
                None => return false,
            },
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            _ => {}
        }
        i += 1;
    }

    depth == 0
}

/// Index just past the literal opened at `open`, or `None` if it is still
/// open at the end of `bytes`.
fn string_end(bytes: &[u8], open: usize, quote: u8) -> Option<usize> {
    let triple = bytes.get(open + 1) == Some(&quote) && bytes.get(open + 2) == Some(&quote);
    let mut j = open + if triple { 3 } else { 1 };

    while j < bytes.len() {
        let c = bytes[j];
        if c == b'\\' {
            j += 2;
            continue;
        }
        if triple {
            if c == quote && bytes.get(j + 1) == Some(&quote) && bytes.get(j + 2) == Some(&quote) {
                return Some(j + 3);
            }
        } else if c == quote {
            return Some(j + 1);
        } else if c == b'\n' {
            return None;
        }
        j += 1;
    }

    None
}
