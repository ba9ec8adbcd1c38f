//! Script lexer
//!
//! Classification is line oriented:
//! - `#` at line start is a comment
//! - `[NAME]` is a device section header
//! - `<word args...>` is a control keyword or an operation in bracket form
//! - `include path` is an include directive
//! - a line whose first word names a schema operation is that operation
//! - any other line inside a device section is a raw device command, kept verbatim
//! - any other line before the first section must name an operation
//!
//! Arguments split on whitespace. Double-quoted strings support `\"`, `\\`,
//! `\n` and `\t`, and a backslash right before the end of the line continues
//! the string on the next line. Single-quoted strings are verbatim.

use crate::error::LexError;
use crate::schema::{is_control_keyword, Schema};

/// The kind of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Section,
    Command,
    Operation,
    Keyword,
    Comment,
    Include,
    StringLiteral,
    NumberLiteral,
    Identifier,
    VariableReference,
    Flag,
    Symbol,
}

impl TokenKind {
    /// Whether this kind starts a statement
    pub fn is_head(&self) -> bool {
        matches!(
            self,
            TokenKind::Section
                | TokenKind::Command
                | TokenKind::Operation
                | TokenKind::Keyword
                | TokenKind::Comment
                | TokenKind::Include
        )
    }
}

/// A token with the line it started on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Token text. String literals hold their unescaped content.
    pub text: String,
    pub line: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, line: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
        }
    }
}

const SYMBOLS: &[&str] = &["==", "!=", "<=", ">=", "<", ">", "=", "+", "-", "*", "/", "%"];

/// Tokenizes script text. Needs the schema to tell bare operations from
/// raw device commands.
pub struct Lexer<'s> {
    schema: &'s Schema,
}

impl<'s> Lexer<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self { schema }
    }

    /// Convert source text into tokens in source order.
    pub fn tokenize(&self, source: &str) -> Result<Vec<Token>, LexError> {
        let lines: Vec<&str> = source.lines().collect();
        let mut tokens = Vec::new();
        let mut in_section = false;
        let mut next = 0;

        while next < lines.len() {
            let line_number = next + 1;
            let text = lines[next].trim();
            next += 1;

            if text.is_empty() {
                continue;
            }
            if let Some(rest) = text.strip_prefix('#') {
                tokens.push(Token::new(TokenKind::Comment, rest.trim(), line_number));
                continue;
            }

            match text.as_bytes()[0] {
                b'[' => {
                    let name = text
                        .strip_prefix('[')
                        .and_then(|t| t.strip_suffix(']'))
                        .ok_or_else(|| LexError::new(line_number, "unterminated section header"))?
                        .trim();
                    if name.is_empty() || name.contains(char::is_whitespace) {
                        return Err(LexError::new(line_number, format!("invalid section name {:?}", name)));
                    }
                    tokens.push(Token::new(TokenKind::Section, name, line_number));
                    in_section = true;
                }
                b'<' => {
                    let inner = text
                        .strip_prefix('<')
                        .and_then(|t| t.strip_suffix('>'))
                        .ok_or_else(|| LexError::new(line_number, "unterminated statement: missing '>'"))?
                        .trim();
                    if inner.is_empty() {
                        return Err(LexError::new(line_number, "empty statement"));
                    }
                    let (head, rest) = split_head(inner);
                    let kind = if is_control_keyword(head) {
                        TokenKind::Keyword
                    } else {
                        TokenKind::Operation
                    };
                    tokens.push(Token::new(kind, head, line_number));
                    lex_args(rest, line_number, &lines, &mut next, &mut tokens)?;
                }
                b']' | b'>' | b'}' => {
                    return Err(LexError::new(
                        line_number,
                        format!("unrecognized leading symbol {:?}", &text[..1]),
                    ));
                }
                _ => {
                    let (head, rest) = split_head(text);
                    if head == "include" {
                        tokens.push(Token::new(TokenKind::Include, head, line_number));
                        lex_args(rest, line_number, &lines, &mut next, &mut tokens)?;
                    } else if (self.schema.contains(head) && !is_control_keyword(head)) || !in_section {
                        tokens.push(Token::new(TokenKind::Operation, head, line_number));
                        lex_args(rest, line_number, &lines, &mut next, &mut tokens)?;
                    } else {
                        tokens.push(Token::new(TokenKind::Command, text, line_number));
                    }
                }
            }
        }

        Ok(tokens)
    }
}

/// Split off the first whitespace-delimited word
fn split_head(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(i) => (&text[..i], text[i..].trim_start()),
        None => (text, ""),
    }
}

/// Lex the argument part of a statement. A double-quoted string ending in
/// an escaped newline pulls in the next physical line, advancing `next`.
fn lex_args(
    rest: &str,
    line_number: usize,
    lines: &[&str],
    next: &mut usize,
    tokens: &mut Vec<Token>,
) -> Result<(), LexError> {
    let mut chars: Vec<char> = rest.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '"' {
            let mut s = String::new();
            i += 1;
            loop {
                if i >= chars.len() {
                    return Err(LexError::new(line_number, "unterminated string literal"));
                }
                match chars[i] {
                    '"' => {
                        i += 1;
                        break;
                    }
                    '\\' if i + 1 == chars.len() => {
                        // escaped newline: continue on the next physical line
                        if *next >= lines.len() {
                            return Err(LexError::new(line_number, "unterminated string literal"));
                        }
                        s.push('\n');
                        chars = lines[*next].chars().collect();
                        *next += 1;
                        i = 0;
                    }
                    '\\' => {
                        match chars[i + 1] {
                            'n' => s.push('\n'),
                            't' => s.push('\t'),
                            '"' => s.push('"'),
                            '\\' => s.push('\\'),
                            other => {
                                s.push('\\');
                                s.push(other);
                            }
                        }
                        i += 2;
                    }
                    other => {
                        s.push(other);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::new(TokenKind::StringLiteral, s, line_number));
            continue;
        }

        if c == '\'' {
            let start = i + 1;
            let end = chars[start..]
                .iter()
                .position(|&ch| ch == '\'')
                .map(|p| start + p)
                .ok_or_else(|| LexError::new(line_number, "unterminated string literal"))?;
            let s: String = chars[start..end].iter().collect();
            tokens.push(Token::new(TokenKind::StringLiteral, s, line_number));
            i = end + 1;
            continue;
        }

        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect();
        let kind = classify_word(&word);
        tokens.push(Token::new(kind, word, line_number));
    }

    Ok(())
}

fn classify_word(word: &str) -> TokenKind {
    if is_variable_reference(word) {
        TokenKind::VariableReference
    } else if is_number(word) {
        TokenKind::NumberLiteral
    } else if SYMBOLS.contains(&word) {
        TokenKind::Symbol
    } else if word.len() > 1
        && word.starts_with('-')
        && word[1..].starts_with(|c: char| c.is_ascii_alphabetic())
    {
        TokenKind::Flag
    } else {
        TokenKind::Identifier
    }
}

/// `$NAME` or `{$NAME}`
pub fn is_variable_reference(word: &str) -> bool {
    if let Some(name) = word.strip_prefix("{$").and_then(|w| w.strip_suffix('}')) {
        return is_var_name(name);
    }
    word.strip_prefix('$').map_or(false, is_var_name)
}

/// Letters, digits and `_`, not starting with a digit
pub fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `-?digits[.digits]`
pub(crate) fn is_number(word: &str) -> bool {
    let digits = word.strip_prefix('-').unwrap_or(word);
    let mut parts = digits.splitn(2, '.');
    let int_ok = parts
        .next()
        .map_or(false, |p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    let frac_ok = parts
        .next()
        .map_or(true, |p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    int_ok && frac_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<Token> {
        Lexer::new(Schema::builtin()).tokenize(src).unwrap()
    }

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_empty_and_comments() {
        let tokens = lex("\n   \n# a comment\n");
        assert_eq!(tokens, vec![Token::new(TokenKind::Comment, "a comment", 3)]);
    }

    #[test]
    fn test_section_and_raw_command() {
        let tokens = lex("[FGT_A]\n  get system status | grep 'Version\n");
        assert_eq!(tokens[0], Token::new(TokenKind::Section, "FGT_A", 1));
        // raw commands are kept verbatim, quotes and all
        assert_eq!(tokens[1], Token::new(TokenKind::Command, "get system status | grep 'Version", 2));
    }

    #[test]
    fn test_flagged_operation() {
        let tokens = lex("[PC]\nexpect -e \"login: \" -t 5 -for 801830");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Section,
                TokenKind::Operation,
                TokenKind::Flag,
                TokenKind::StringLiteral,
                TokenKind::Flag,
                TokenKind::NumberLiteral,
                TokenKind::Flag,
                TokenKind::NumberLiteral,
            ]
        );
        assert_eq!(tokens[3].text, "login: ");
    }

    #[test]
    fn test_bracket_keyword() {
        let tokens = lex("<loop {$count} < 3>");
        assert_eq!(tokens[0], Token::new(TokenKind::Keyword, "loop", 1));
        assert_eq!(tokens[1], Token::new(TokenKind::VariableReference, "{$count}", 1));
        assert_eq!(tokens[2], Token::new(TokenKind::Symbol, "<", 1));
        assert_eq!(tokens[3], Token::new(TokenKind::NumberLiteral, "3", 1));
    }

    #[test]
    fn test_bracket_operation() {
        let tokens = lex("<intchange {$count} + 1>");
        assert_eq!(tokens[0].kind, TokenKind::Operation);
        assert_eq!(tokens[2].kind, TokenKind::Symbol);
    }

    #[test]
    fn test_include() {
        let tokens = lex("include lib/$LIB/login.dvs");
        assert_eq!(tokens[0].kind, TokenKind::Include);
        assert_eq!(tokens[1], Token::new(TokenKind::Identifier, "lib/$LIB/login.dvs", 1));
    }

    #[test]
    fn test_unknown_word_outside_section_is_operation() {
        let tokens = lex("foobar -x 1");
        assert_eq!(tokens[0], Token::new(TokenKind::Operation, "foobar", 1));
        assert_eq!(tokens[1].kind, TokenKind::Flag);
    }

    #[test]
    fn test_variable_references() {
        let tokens = lex("strset x $HOST {$y} $1abc");
        assert_eq!(tokens[2].kind, TokenKind::VariableReference);
        assert_eq!(tokens[3].kind, TokenKind::VariableReference);
        assert_eq!(tokens[4].kind, TokenKind::Identifier);
    }

    #[test]
    fn test_numbers_and_flags() {
        assert_eq!(classify_word("-5"), TokenKind::NumberLiteral);
        assert_eq!(classify_word("1.25"), TokenKind::NumberLiteral);
        assert_eq!(classify_word("1."), TokenKind::Identifier);
        assert_eq!(classify_word("-retry_cnt"), TokenKind::Flag);
        assert_eq!(classify_word("-"), TokenKind::Symbol);
    }

    #[test]
    fn test_string_escapes() {
        let tokens = lex(r#"comment "a \"b\" \\ c\td""#);
        assert_eq!(tokens[1].text, "a \"b\" \\ c\td");
    }

    #[test]
    fn test_single_quoted_string() {
        let tokens = lex("comment 'no \\n escapes'");
        assert_eq!(tokens[1].text, "no \\n escapes");
    }

    #[test]
    fn test_escaped_newline_continues_string() {
        let tokens = lex("comment \"first\\\n  second\"\nsleep 1");
        assert_eq!(tokens[1], Token::new(TokenKind::StringLiteral, "first\n  second", 1));
        assert_eq!(tokens[2], Token::new(TokenKind::Operation, "sleep", 3));
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new(Schema::builtin()).tokenize("sleep 1\ncomment \"oops").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_escaped_newline_at_eof() {
        let err = Lexer::new(Schema::builtin()).tokenize("comment \"oops\\").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_unterminated_bracket() {
        let err = Lexer::new(Schema::builtin()).tokenize("<if {$x} eq 1").unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_unterminated_section() {
        let err = Lexer::new(Schema::builtin()).tokenize("\n[FGT_A").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_stray_leading_symbol() {
        let err = Lexer::new(Schema::builtin()).tokenize("[A]\n} oops").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("leading symbol"));
    }

    #[test]
    fn test_bare_keyword_in_section_is_raw_command() {
        let tokens = lex("[A]\nfi");
        assert_eq!(tokens[1].kind, TokenKind::Command);
    }
}
