//! The matching and action DSLs.
//!
//! Both sub-grammars share one hand-written lexer and recursive-descent
//! parser. The first error aborts the invocation with a positioned
//! diagnostic naming the sub-grammar; there is no recovery.
//!
//! ```text
//! MATCH  ::= [ '!' ] ATTRIBUTE [ CMP VALUES ]
//! VALUES ::= REGEX | INTEGER (',' INTEGER)* | BASENAME '[' INTEGER ']'
//! ACTION ::= 'passthru' | 'print' | 'trap' | 'plugin' '[' NAME ']' | CALL
//! CALL   ::= 'call' [ '[' FLAG (',' FLAG)* ']' ] SYM [ '(' ARG (',' ARG)* ')' ] '@' FILE
//! ```

use crate::csv::IntIndex;
use crate::result::{Error, Result};
use crate::rules::{
    call_trampoline_name, Action, ActionKind, Argument, ArgumentKind, CallPosition, Field,
    MatchCmp, MatchEntry, MatchKind, Payload, Register, RuleSet, MAX_ARGS,
};
use regex::Regex;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    /// Bare identifier or double-quoted string.
    Ident(String),
    Int(i64),
    /// Slash-delimited regular expression; only produced on request.
    Regex(String),
    /// Comparison operator, already folded (`=`/`==` are one token).
    Cmp(MatchCmp),
    Punct(char),
    End,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("`{s}'"),
            Token::Int(i) => format!("integer {i}"),
            Token::Regex(_) => "regular expression".into(),
            Token::Cmp(_) => "comparison operator".into(),
            Token::Punct(c) => format!("`{c}'"),
            Token::End => "end of input".into(),
        }
    }
}

struct Lexer<'a> {
    mode: &'static str,
    src: &'a str,
    pos: usize,
    peeked: Option<(usize, Token)>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str, mode: &'static str) -> Self {
        Lexer {
            mode,
            src,
            pos: 0,
            peeked: None,
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::Parse {
            mode: self.mode,
            message: message.into(),
            column: self.pos + 1,
        }
    }

    fn unexpected(&self, found: &Token, expected: &str) -> Error {
        self.error(format!("expected {expected}, found {}", found.describe()))
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let bytes = self.src.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn next(&mut self) -> Result<Token> {
        if let Some((end, tok)) = self.peeked.take() {
            self.pos = end;
            return Ok(tok);
        }
        let (end, tok) = self.lex()?;
        self.pos = end;
        Ok(tok)
    }

    fn peek(&mut self) -> Result<&Token> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lex()?);
        }
        Ok(&self.peeked.as_ref().unwrap().1)
    }

    /// Lexes one token starting at `self.pos`, returning it with the
    /// position just past it.
    fn lex(&mut self) -> Result<(usize, Token)> {
        self.skip_ws();
        let bytes = self.src.as_bytes();
        let mut i = self.pos;
        if i >= bytes.len() {
            return Ok((i, Token::End));
        }
        let c = bytes[i] as char;
        match c {
            '!' if bytes.get(i + 1) == Some(&b'=') => Ok((i + 2, Token::Cmp(MatchCmp::Neq))),
            '<' if bytes.get(i + 1) == Some(&b'=') => Ok((i + 2, Token::Cmp(MatchCmp::Leq))),
            '>' if bytes.get(i + 1) == Some(&b'=') => Ok((i + 2, Token::Cmp(MatchCmp::Geq))),
            '=' => {
                let skip = if bytes.get(i + 1) == Some(&b'=') { 2 } else { 1 };
                Ok((i + skip, Token::Cmp(MatchCmp::Eq)))
            }
            '<' => Ok((i + 1, Token::Cmp(MatchCmp::Lt))),
            '>' => Ok((i + 1, Token::Cmp(MatchCmp::Gt))),
            '!' | '[' | ']' | '(' | ')' | ',' | '.' | '&' | '@' | '/' => {
                Ok((i + 1, Token::Punct(c)))
            }
            '"' => {
                i += 1;
                let start = i;
                while i < bytes.len() && bytes[i] != b'"' {
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(self.error("unterminated string"));
                }
                Ok((i + 1, Token::Ident(self.src[start..i].to_string())))
            }
            '+' | '-' | '0'..='9' => self.lex_int(i),
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                Ok((i, Token::Ident(self.src[start..i].to_string())))
            }
            _ => Err(self.error(format!("unexpected character `{c}'"))),
        }
    }

    fn lex_int(&self, start: usize) -> Result<(usize, Token)> {
        let bytes = self.src.as_bytes();
        let mut i = start;
        let neg = match bytes[i] {
            b'-' => {
                i += 1;
                true
            }
            b'+' => {
                i += 1;
                false
            }
            _ => false,
        };
        let (radix, digits_start) =
            if bytes.get(i) == Some(&b'0') && matches!(bytes.get(i + 1), Some(b'x') | Some(b'X')) {
                (16, i + 2)
            } else {
                (10, i)
            };
        i = digits_start;
        while i < bytes.len() && (bytes[i] as char).is_digit(radix) {
            i += 1;
        }
        if i == digits_start {
            return Err(self.error("expected an integer"));
        }
        let value = i64::from_str_radix(&self.src[digits_start..i], radix)
            .map_err(|_| self.error("integer out of range"))?;
        Ok((i, Token::Int(if neg { -value } else { value })))
    }

    /// Lexes a slash-delimited regular expression, or falls back to ordinary
    /// tokenisation. Only the VALUES position of string attributes requests
    /// this, so `/` never clashes with other grammar.
    fn next_regex(&mut self) -> Result<Token> {
        if self.peeked.is_some() {
            // Already lexed as an ordinary token; a regex cannot start here.
            return self.next();
        }
        self.skip_ws();
        let bytes = self.src.as_bytes();
        if bytes.get(self.pos) != Some(&b'/') {
            return self.next();
        }
        let mut i = self.pos + 1;
        let start = i;
        while i < bytes.len() && !(bytes[i] == b'/' && bytes[i - 1] != b'\\') {
            i += 1;
        }
        if i >= bytes.len() {
            return Err(self.error("unterminated regular expression"));
        }
        let body = self.src[start..i].replace("\\/", "/");
        self.pos = i + 1;
        Ok(Token::Regex(body))
    }

    fn expect_punct(&mut self, c: char) -> Result<()> {
        match self.next()? {
            Token::Punct(p) if p == c => Ok(()),
            tok => Err(self.unexpected(&tok, &format!("`{c}'"))),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.next()? {
            Token::Ident(s) => Ok(s),
            tok => Err(self.unexpected(&tok, what)),
        }
    }

    fn expect_int(&mut self) -> Result<i64> {
        match self.next()? {
            Token::Int(i) => Ok(i),
            tok => Err(self.unexpected(&tok, "an integer")),
        }
    }

    fn expect_end(&mut self) -> Result<()> {
        match self.next()? {
            Token::End => Ok(()),
            tok => Err(self.unexpected(&tok, "end of input")),
        }
    }

    fn eat_punct(&mut self, c: char) -> Result<bool> {
        if *self.peek()? == Token::Punct(c) {
            self.next()?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Parses `[ INT ]` and range-checks the index.
fn parse_index(lexer: &mut Lexer<'_>, lb: i64, ub: i64) -> Result<i64> {
    lexer.expect_punct('[')?;
    let idx = lexer.expect_int()?;
    lexer.expect_punct(']')?;
    if idx < lb || idx > ub {
        return Err(lexer.error(format!(
            "expected index within the range {lb}..{ub}, found {idx}"
        )));
    }
    Ok(idx)
}

/// Parses a CSV basename, tolerating an explicit `.csv` suffix.
fn parse_basename(lexer: &mut Lexer<'_>, first: String) -> Result<String> {
    if *lexer.peek()? == Token::Punct('.') {
        lexer.next()?;
        let suffix = lexer.expect_ident("`csv'")?;
        if suffix != "csv" {
            return Err(lexer.error(format!("expected `csv' suffix, found `{suffix}'")));
        }
    }
    Ok(first)
}

/// Compiles one `--match` clause and appends it to the pending conjunction.
pub fn parse_match(source: &str, rules: &mut RuleSet) -> Result<()> {
    let mut lexer = Lexer::new(source, "matching");

    let neg = lexer.eat_punct('!')?;
    let attr = lexer.expect_ident("an attribute")?;
    let kind = match attr.as_str() {
        "true" => MatchKind::True,
        "false" => MatchKind::False,
        "asm" => MatchKind::Assembly,
        "addr" => MatchKind::Address,
        "call" => MatchKind::Call,
        "dst" => MatchKind::Dst,
        "imm" => MatchKind::Imm,
        "jump" => MatchKind::Jump,
        "mem" => MatchKind::Mem,
        "mnemonic" => MatchKind::Mnemonic,
        "offset" => MatchKind::Offset,
        "op" => MatchKind::Op,
        "plugin" => MatchKind::Plugin,
        "random" => MatchKind::Random,
        "reg" => MatchKind::Reg,
        "return" => MatchKind::Return,
        "size" => MatchKind::Size,
        "src" => MatchKind::Src,
        _ => return Err(lexer.error(format!("unknown attribute `{attr}'"))),
    };

    let mut plugin = None;
    let mut idx = None;
    let mut field = Field::None;
    match kind {
        MatchKind::Plugin => {
            lexer.expect_punct('[')?;
            let name = lexer.expect_ident("a plugin name")?;
            lexer.expect_punct(']')?;
            let handle = rules.plugins.open(&name)?;
            if !handle.borrow().has_match {
                return Err(Error::Plugin {
                    path: handle.borrow().path.display().to_string(),
                    message: "the plugin does not export the \"e9_plugin_match_v1\" function"
                        .into(),
                });
            }
            // An instr hook anywhere forces the notification pass.
            rules.notify |= handle.borrow().has_instr;
            plugin = Some(handle);
        }
        k if k.is_operand() => {
            match lexer.peek()? {
                Token::Punct('.') => (),
                Token::Punct('[') => idx = Some(parse_index(&mut lexer, 0, 7)? as u8),
                tok => {
                    let tok = tok.clone();
                    return Err(lexer.unexpected(&tok, "`[' or `.'"));
                }
            }
            lexer.expect_punct('.')?;
            let name = lexer.expect_ident("a field selector")?;
            field = match name.as_str() {
                "size" => Field::Size,
                "type" => Field::Type,
                "read" => Field::Read,
                "write" => Field::Write,
                _ => return Err(lexer.error(format!("unknown field selector `{name}'"))),
            };
        }
        _ => (),
    }

    let mut cmp = match lexer.next()? {
        Token::Cmp(cmp) => cmp,
        Token::End => MatchCmp::NeqZero,
        tok => return Err(lexer.unexpected(&tok, "a comparison operator or end of input")),
    };
    if neg {
        cmp = cmp.negate();
    }

    match kind {
        MatchKind::Assembly | MatchKind::Mnemonic => {
            if cmp != MatchCmp::Eq && cmp != MatchCmp::Neq {
                return Err(lexer.error(format!(
                    "invalid match comparison operator for attribute \"{attr}\""
                )));
            }
        }
        MatchKind::Call | MatchKind::Jump | MatchKind::Return | MatchKind::Plugin => {
            rules.detail = true;
        }
        k if k.is_operand() => rules.detail = true,
        _ => (),
    }

    let mut basename = None;
    let payload = match kind {
        MatchKind::Assembly | MatchKind::Mnemonic => {
            let pattern = match lexer.next_regex()? {
                Token::Regex(body) => body,
                Token::Ident(first) => {
                    // A value list compiles to an alternation regex.
                    let mut pattern = format!("({first})");
                    while lexer.eat_punct(',')? {
                        let next = lexer.expect_ident("a string")?;
                        pattern.push_str(&format!("|({next})"));
                    }
                    pattern
                }
                tok => return Err(lexer.unexpected(&tok, "a regular expression or string")),
            };
            lexer.expect_end()?;
            // Whole-string matching, like the assembly strings it filters.
            let anchored = format!("^(?:{pattern})$");
            let regex = Regex::new(&anchored)
                .map_err(|e| lexer.error(format!("invalid regular expression: {e}")))?;
            Payload::Regex(regex)
        }
        _ if cmp == MatchCmp::EqZero || cmp == MatchCmp::NeqZero => Payload::None,
        _ => {
            let index = match lexer.next()? {
                Token::Int(first) => {
                    let mut values = vec![first];
                    while lexer.eat_punct(',')? {
                        values.push(lexer.expect_int()?);
                    }
                    IntIndex::from_values(values)
                }
                Token::Ident(name) => {
                    let name = parse_basename(&mut lexer, name)?;
                    let col = parse_index(&mut lexer, 0, i64::MAX)?;
                    let table = rules.csv.load(&name)?;
                    basename = Some(table.basename.clone());
                    IntIndex::from_table(table, col as usize)?
                }
                tok => return Err(lexer.unexpected(&tok, "an integer or CSV basename")),
            };
            lexer.expect_end()?;
            Payload::Values(index)
        }
    };

    rules.pending.push(MatchEntry {
        source: source.to_string(),
        kind,
        idx,
        field,
        cmp,
        plugin,
        payload,
        basename,
    });
    Ok(())
}

/// Parses one call argument (the `&`, the kind, and any index).
fn parse_argument(
    lexer: &mut Lexer<'_>,
    rules: &mut RuleSet,
    args: &[Argument],
) -> Result<Argument> {
    let ptr = lexer.eat_punct('&')?;
    let mut value = 0i64;
    let mut basename = None;
    let kind = match lexer.next()? {
        Token::Int(i) => {
            value = i;
            ArgumentKind::Integer
        }
        Token::Ident(name) => match name.as_str() {
            "asm" => {
                if lexer.eat_punct('.')? {
                    let field = lexer.expect_ident("`len' or `size'")?;
                    match field.as_str() {
                        "len" => ArgumentKind::AsmLen,
                        "size" => ArgumentKind::AsmSize,
                        _ => {
                            return Err(
                                lexer.error(format!("unknown asm field `{field}'"))
                            )
                        }
                    }
                } else {
                    ArgumentKind::Asm
                }
            }
            "addr" => ArgumentKind::Addr,
            "base" => ArgumentKind::Base,
            "dst" => ArgumentKind::Dst,
            "imm" => ArgumentKind::Imm,
            "instr" => ArgumentKind::Bytes,
            "mem" => ArgumentKind::Mem,
            "next" => {
                rules.detail = true;
                ArgumentKind::Next
            }
            "offset" => ArgumentKind::Offset,
            "op" => ArgumentKind::Op,
            "random" => ArgumentKind::Random,
            "reg" => ArgumentKind::Reg,
            "size" => ArgumentKind::BytesSize,
            "staticAddr" => ArgumentKind::StaticAddr,
            "src" => ArgumentKind::Src,
            "target" => {
                rules.detail = true;
                ArgumentKind::Target
            }
            "trampoline" => ArgumentKind::Trampoline,
            other => {
                if let Some(reg) = Register::from_name(other) {
                    ArgumentKind::Register(reg)
                } else if rules
                    .pending
                    .iter()
                    .any(|e| e.basename.as_deref() == Some(other))
                {
                    basename = Some(other.to_string());
                    value = parse_index(lexer, 0, i64::MAX)?;
                    ArgumentKind::User
                } else {
                    return Err(lexer.error(format!("unknown argument `{other}'")));
                }
            }
        },
        tok => return Err(lexer.unexpected(&tok, "an argument")),
    };

    if kind.is_operand() {
        rules.detail = true;
        value = parse_index(lexer, 0, 7)?;
    }
    if ptr && !kind.supports_pointer() {
        return Err(lexer.error("cannot pass this argument by pointer".to_string()));
    }
    let duplicate = args.iter().any(|prev| prev.kind.same_kind(kind));
    Ok(Argument {
        kind,
        ptr,
        duplicate,
        value,
        basename,
    })
}

/// Compiles one `--action` clause, consuming the pending match conjunction.
pub fn parse_action(source: &str, rules: &mut RuleSet) -> Result<()> {
    if rules.pending.is_empty() {
        return Err(Error::Config(
            "the `--action' or `-A' option must be preceded by one or more \
             `--match' or `-M' options"
                .into(),
        ));
    }

    let mut lexer = Lexer::new(source, "action");
    let word = lexer.expect_ident("an action kind")?;
    let kind = match word.as_str() {
        "call" => ActionKind::Call,
        "passthru" => ActionKind::Passthru,
        "plugin" => ActionKind::Plugin,
        "print" => ActionKind::Print,
        "trap" => ActionKind::Trap,
        _ => return Err(lexer.error(format!("unknown action `{word}'"))),
    };

    let mut clean = false;
    let mut naked = false;
    let mut position_flags: Vec<CallPosition> = Vec::new();
    let mut symbol = None;
    let mut filename = None;
    let mut plugin = None;
    let mut args = Vec::new();

    match kind {
        ActionKind::Plugin => {
            lexer.expect_punct('[')?;
            let name = lexer.expect_ident("a plugin name")?;
            lexer.expect_punct(']')?;
            lexer.expect_end()?;
            let handle = rules.plugins.open(&name)?;
            rules.notify |= handle.borrow().has_instr;
            plugin = Some(handle);
            filename = Some(name);
            rules.detail = true;
        }
        ActionKind::Call => {
            if lexer.eat_punct('[')? {
                loop {
                    let flag = lexer.expect_ident("a call attribute")?;
                    match flag.as_str() {
                        "after" => position_flags.push(CallPosition::After),
                        "before" => position_flags.push(CallPosition::Before),
                        "clean" => clean = true,
                        "conditional" => position_flags.push(CallPosition::Conditional),
                        "naked" => naked = true,
                        "replace" => position_flags.push(CallPosition::Replace),
                        _ => {
                            return Err(
                                lexer.error(format!("unknown call attribute `{flag}'"))
                            )
                        }
                    }
                    match lexer.next()? {
                        Token::Punct(']') => break,
                        Token::Punct(',') => (),
                        tok => return Err(lexer.unexpected(&tok, "`,' or `]'")),
                    }
                }
            }
            symbol = Some(lexer.expect_ident("a function name")?);
            if lexer.eat_punct('(')? {
                if !lexer.eat_punct(')')? {
                    loop {
                        args.push(parse_argument(&mut lexer, rules, &args)?);
                        match lexer.next()? {
                            Token::Punct(')') => break,
                            Token::Punct(',') => (),
                            tok => return Err(lexer.unexpected(&tok, "`,' or `)'")),
                        }
                    }
                }
                if args.len() > MAX_ARGS {
                    return Err(lexer.error(format!(
                        "too many arguments ({}), a maximum of {MAX_ARGS} are supported",
                        args.len()
                    )));
                }
            }
            lexer.expect_punct('@')?;
            // The remainder is the callee file path, taken verbatim.
            let file = lexer.rest().trim();
            if file.is_empty() {
                return Err(lexer.error("expected a callee file after `@'".to_string()));
            }
            filename = Some(file.to_string());

            if clean && naked {
                return Err(lexer.error(
                    "`clean' and `naked' attributes cannot be used together".to_string(),
                ));
            }
            if position_flags.len() > 1 {
                return Err(lexer.error(
                    "only one of the `before', `after', `replace' and `conditional' \
                     attributes can be used together"
                        .to_string(),
                ));
            }
            clean = clean || !naked;
        }
        _ => lexer.expect_end()?,
    }

    let position = position_flags.pop().unwrap_or(CallPosition::Before);
    let name = match kind {
        ActionKind::Print => "print".to_string(),
        ActionKind::Passthru => "passthru".to_string(),
        ActionKind::Trap => "trap".to_string(),
        ActionKind::Call => call_trampoline_name(
            clean,
            position,
            symbol.as_deref().unwrap_or(""),
            filename.as_deref().unwrap_or(""),
        ),
        ActionKind::Plugin => format!("plugin_{}", filename.as_deref().unwrap_or("")),
    };

    rules.actions.push(Action {
        source: source.to_string(),
        entries: std::mem::take(&mut rules.pending),
        kind,
        name,
        filename,
        symbol,
        elf: None,
        plugin,
        args,
        clean,
        position,
    });
    Ok(())
}
