//! Canonical form of command text
//!
//! Two commands that differ only cosmetically (whitespace, keyword case,
//! comments) canonicalize to the same text. Quoted identifiers and string
//! literals are kept verbatim. Commands whose result depends on who runs them
//! report the narrowest scope they may be shared in.

use crate::directive::Scope;
use crate::error::{CacheError, CacheResult};

/// Functions whose result changes between executions
const NON_DETERMINISTIC_FUNCTIONS: &[&str] = &[
    "NOW",
    "RAND",
    "RANDOM",
    "UUID",
    "NEWID",
    "GEN_RANDOM_UUID",
    "UUID_GENERATE_V4",
    "GETDATE",
    "CURDATE",
    "CURTIME",
    "SYSDATETIME",
    "CLOCK_TIMESTAMP",
    "STATEMENT_TIMESTAMP",
    "TIMEOFDAY",
    "NEXTVAL",
];

/// Niladic values that read the clock without parentheses
const NON_DETERMINISTIC_VALUES: &[&str] = &[
    "CURRENT_TIMESTAMP",
    "CURRENT_DATE",
    "CURRENT_TIME",
    "LOCALTIME",
    "LOCALTIMESTAMP",
    "SYSDATE",
    "SYSTIMESTAMP",
];

/// Functions whose result depends on the calling user
const USER_FUNCTIONS: &[&str] = &["USER", "CURRENT_USER", "SESSION_USER", "SYSTEM_USER"];

/// Niladic values naming the calling user
const USER_VALUES: &[&str] = &["CURRENT_USER", "SESSION_USER", "SYSTEM_USER", "CURRENT_ROLE"];

/// Functions whose result depends on the calling session
const SESSION_FUNCTIONS: &[&str] = &[
    "SESSION_ID",
    "CONNECTION_ID",
    "CURRENT_SCHEMA",
    "LAST_INSERT_ID",
    "COMMAND_PAYLOAD",
    "ENV",
];

/// Canonicalized command text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalCommand {
    pub text: String,
    /// Narrowest scope the result may be shared in, when the text reads the
    /// caller's identity
    pub required_scope: Option<Scope>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    QuotedIdentifier(String),
    Literal(String),
    Number(String),
    Symbol(&'static str),
    Placeholder(String),
}

/// Canonicalize command text, rejecting non-deterministic commands
pub fn canonicalize(sql: &str) -> CacheResult<CanonicalCommand> {
    let tokens = Canonicalizer::new(sql).tokenize()?;
    check_deterministic(&tokens)?;
    let required_scope = caller_scope(&tokens);

    let mut text = String::with_capacity(sql.len());
    let end = tokens
        .iter()
        .rposition(|token| *token != Token::Symbol(";"))
        .map_or(0, |position| position + 1);

    for token in &tokens[..end] {
        if !text.is_empty() {
            text.push(' ');
        }
        match token {
            Token::Word(word) => text.push_str(word),
            Token::QuotedIdentifier(ident) => {
                text.push('"');
                text.push_str(&ident.replace('"', "\"\""));
                text.push('"');
            }
            Token::Literal(value) => {
                text.push('\'');
                text.push_str(&value.replace('\'', "''"));
                text.push('\'');
            }
            Token::Number(number) => text.push_str(number),
            Token::Symbol(symbol) => text.push_str(symbol),
            Token::Placeholder(marker) => text.push_str(marker),
        }
    }

    Ok(CanonicalCommand {
        text,
        required_scope,
    })
}

/// Unqualified words with whether each is immediately called
fn bare_words(tokens: &[Token]) -> impl Iterator<Item = (&str, bool)> {
    tokens.iter().enumerate().filter_map(|(position, token)| {
        let Token::Word(word) = token else {
            return None;
        };
        if position > 0 && tokens[position - 1] == Token::Symbol(".") {
            return None;
        }
        let called = tokens.get(position + 1) == Some(&Token::Symbol("("));
        Some((word.as_str(), called))
    })
}

fn check_deterministic(tokens: &[Token]) -> CacheResult<()> {
    for (word, called) in bare_words(tokens) {
        if NON_DETERMINISTIC_VALUES.contains(&word)
            || (called && NON_DETERMINISTIC_FUNCTIONS.contains(&word))
        {
            return Err(CacheError::KeyDerivation(format!(
                "non-deterministic function {}",
                word
            )));
        }
    }
    Ok(())
}

fn caller_scope(tokens: &[Token]) -> Option<Scope> {
    let mut required = None;
    for (word, called) in bare_words(tokens) {
        if called && SESSION_FUNCTIONS.contains(&word) {
            return Some(Scope::Session);
        }
        if USER_VALUES.contains(&word) || (called && USER_FUNCTIONS.contains(&word)) {
            required = Some(Scope::User);
        }
    }
    required
}

struct Canonicalizer {
    input: Vec<char>,
    position: usize,
}

impl Canonicalizer {
    fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
        }
    }

    fn tokenize(&mut self) -> CacheResult<Vec<Token>> {
        let mut tokens = Vec::new();

        loop {
            self.skip_trivia()?;
            if self.position >= self.input.len() {
                break;
            }
            tokens.push(self.next_token()?);
        }

        Ok(tokens)
    }

    fn skip_trivia(&mut self) -> CacheResult<()> {
        while let Some(ch) = self.peek(0) {
            if ch.is_whitespace() {
                self.position += 1;
            } else if ch == '-' && self.peek(1) == Some('-') {
                while let Some(ch) = self.peek(0) {
                    self.position += 1;
                    if ch == '\n' {
                        break;
                    }
                }
            } else if ch == '/' && self.peek(1) == Some('*') {
                self.position += 2;
                loop {
                    match (self.peek(0), self.peek(1)) {
                        (Some('*'), Some('/')) => {
                            self.position += 2;
                            break;
                        }
                        (Some(_), _) => self.position += 1,
                        (None, _) => {
                            return Err(CacheError::KeyDerivation(
                                "unterminated comment".to_string(),
                            ))
                        }
                    }
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    fn next_token(&mut self) -> CacheResult<Token> {
        let ch = self.input[self.position];

        let token = match ch {
            '\'' => Token::Literal(self.read_quoted('\'')?),
            '"' => Token::QuotedIdentifier(self.read_quoted('"')?),
            '?' => {
                self.position += 1;
                Token::Placeholder("?".to_string())
            }
            '$' if self.peek(1).is_some_and(|c| c.is_ascii_digit()) => {
                self.position += 1;
                let digits = self.take_while(|c| c.is_ascii_digit());
                Token::Placeholder(format!("${}", digits))
            }
            _ if ch.is_ascii_digit() => Token::Number(self.read_number()),
            _ if ch.is_alphabetic() || ch == '_' => {
                Token::Word(self.take_while(|c| c.is_alphanumeric() || c == '_').to_uppercase())
            }
            _ => Token::Symbol(self.read_symbol()?),
        };

        Ok(token)
    }

    fn read_number(&mut self) -> String {
        if self.peek(0) == Some('0')
            && matches!(self.peek(1), Some('x' | 'X'))
            && self.peek(2).is_some_and(|c| c.is_ascii_hexdigit())
        {
            self.position += 2;
            let digits = self.take_while(|c| c.is_ascii_hexdigit());
            return format!("0x{}", digits.to_uppercase());
        }

        let mut number = self.take_while(|c| c.is_ascii_digit() || c == '.');
        let exponent_digits = match (self.peek(0), self.peek(1)) {
            (Some('e' | 'E'), Some(c)) if c.is_ascii_digit() => Some(1),
            (Some('e' | 'E'), Some('+' | '-')) => {
                self.peek(2).filter(|c| c.is_ascii_digit()).map(|_| 2)
            }
            _ => None,
        };
        if let Some(prefix) = exponent_digits {
            number.push('E');
            if prefix == 2 {
                number.push(self.input[self.position + 1]);
            }
            self.position += prefix;
            number.push_str(&self.take_while(|c| c.is_ascii_digit()));
        }
        number
    }

    fn read_quoted(&mut self, quote: char) -> CacheResult<String> {
        self.position += 1;
        let mut value = String::new();

        loop {
            match self.peek(0) {
                Some(ch) if ch == quote => {
                    if self.peek(1) == Some(quote) {
                        value.push(quote);
                        self.position += 2;
                    } else {
                        self.position += 1;
                        return Ok(value);
                    }
                }
                Some(ch) => {
                    value.push(ch);
                    self.position += 1;
                }
                None => {
                    return Err(CacheError::KeyDerivation(
                        "unterminated quoted text".to_string(),
                    ))
                }
            }
        }
    }

    fn read_symbol(&mut self) -> CacheResult<&'static str> {
        let two = (self.input[self.position], self.peek(1));
        let symbol = match two {
            ('<', Some('=')) => "<=",
            ('>', Some('=')) => ">=",
            ('<', Some('>')) | ('!', Some('=')) => "<>",
            ('|', Some('|')) => "||",
            (':', Some(':')) => "::",
            _ => "",
        };
        if !symbol.is_empty() {
            self.position += 2;
            return Ok(symbol);
        }

        let symbol = match two.0 {
            '+' => "+",
            '-' => "-",
            '*' => "*",
            '/' => "/",
            '%' => "%",
            '=' => "=",
            '<' => "<",
            '>' => ">",
            '(' => "(",
            ')' => ")",
            '[' => "[",
            ']' => "]",
            ',' => ",",
            '.' => ".",
            ';' => ";",
            ':' => ":",
            other => {
                return Err(CacheError::KeyDerivation(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        };
        self.position += 1;
        Ok(symbol)
    }

    fn take_while(&mut self, predicate: impl Fn(char) -> bool) -> String {
        let start = self.position;
        while self.peek(0).is_some_and(&predicate) {
            self.position += 1;
        }
        self.input[start..self.position].iter().collect()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }
}
