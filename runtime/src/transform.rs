//! Source rewriting applied to indexer code before compilation.
//!
//! Every context call completes before returning to the script, so an
//! `await` in front of it has nothing to wait for. The keyword is removed
//! wherever it appears as a whole word in code. A `{` in expression
//! position opens an object literal and is written as the engine's `#{`,
//! so `insert({height: block.blockHeight})` runs as written. String
//! literals and comments are left alone.

const AWAIT: &str = "await";

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Tracks the code emitted so far, ignoring whitespace and comments.
#[derive(Default)]
struct Preceding {
    last: Option<char>,
    significant: Option<char>,
    word: String,
}

impl Preceding {
    fn push(&mut self, c: char) {
        if is_ident_char(c) {
            if !self.last.map_or(false, is_ident_char) {
                self.word.clear();
            }
            self.word.push(c);
        } else if !c.is_whitespace() {
            self.word.clear();
        }
        if !c.is_whitespace() {
            self.significant = Some(c);
        }
        self.last = Some(c);
    }

    fn separate(&mut self) {
        self.last = Some(' ');
    }

    /// A `{` here starts a value rather than a block.
    fn expects_value(&self) -> bool {
        match self.significant {
            Some('(') | Some(',') | Some('=') | Some(':') | Some('[') | Some('?') => true,
            Some(c) if is_ident_char(c) => self.word == "return",
            _ => false,
        }
    }
}

pub fn prepare_source(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    let keyword: Vec<char> = AWAIT.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut preceding = Preceding::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '"' | '\'' | '`' => {
                let end = literal_end(&chars, i, c);
                out.extend(&chars[i..end]);
                preceding.push(c);
                preceding.separate();
                i = end;
            }
            '/' if next == Some('/') => {
                let end = chars[i..]
                    .iter()
                    .position(|&c| c == '\n')
                    .map(|offset| i + offset)
                    .unwrap_or(chars.len());
                out.extend(&chars[i..end]);
                preceding.separate();
                i = end;
            }
            '/' if next == Some('*') => {
                let end = block_comment_end(&chars, i);
                out.extend(&chars[i..end]);
                preceding.separate();
                i = end;
            }
            '{' if preceding.expects_value() => {
                out.push_str("#{");
                preceding.push(c);
                i += 1;
            }
            _ if chars[i..].starts_with(&keyword)
                && (i == 0 || !is_ident_char(chars[i - 1]))
                && chars.get(i + keyword.len()).map_or(true, |&c| !is_ident_char(c)) =>
            {
                i += keyword.len();
                while chars.get(i).map_or(false, |c| *c == ' ' || *c == '\t') {
                    i += 1;
                }
                preceding.separate();
            }
            _ => {
                out.push(c);
                preceding.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Index just past the literal opened at `start`. An unterminated literal
/// runs to the end of the input and is left for the compiler to reject.
fn literal_end(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

/// Block comments nest.
fn block_comment_end(chars: &[char], start: usize) -> usize {
    let mut depth = 0;
    let mut i = start;
    while i < chars.len() {
        match (chars[i], chars.get(i + 1).copied()) {
            ('/', Some('*')) => {
                depth += 1;
                i += 2;
            }
            ('*', Some('/')) => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    chars.len()
}
