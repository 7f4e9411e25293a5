//! Parses an action string into an `ActionBuffer` (§4.4 "opaque action
//! buffer"). Grammar:
//! ```text
//! actions := stmt (";" stmt)* ";"?
//! stmt    := "next" ["(" INT ")"]
//!          | "drop"
//!          | "output" "(" STRING ")"
//!          | "reg" INT "=" value
//!          | "ct_next" | "ct_commit"
//!          | "ct_dnat" ["(" value ")"]
//!          | "ct_snat" ["(" value ")"]
//! ```

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use combine::parser::char::{char, digit, spaces, string};
use combine::{attempt, between, choice, many, many1, optional, satisfy, ParseError, Parser, Stream};
use compact_str::CompactString;
use lpft_expr::Value;

use crate::ast::{ActionBuffer, Stmt};

fn lex<I, P>(p: P) -> impl Parser<I, Output = P::Output>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
    P: Parser<I>,
{
    p.skip(spaces())
}

fn uint<I>() -> impl Parser<I, Output = u64>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    lex(many1(digit())).map(|s: String| s.parse().unwrap())
}

fn quoted<I>() -> impl Parser<I, Output = CompactString>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    lex(between(char('"'), char('"'), many(satisfy(|c: char| c != '"'))))
        .map(|s: String| CompactString::from(s))
}

fn addr_or_int<I>() -> impl Parser<I, Output = Value>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    lex(many1(satisfy(|c: char| c.is_ascii_hexdigit() || c == ':' || c == '.'))).map(|s: String| {
        if let Ok(v4) = Ipv4Addr::from_str(&s) {
            Value::Ipv4(v4)
        } else if let Ok(v6) = Ipv6Addr::from_str(&s) {
            Value::Ipv6(v6)
        } else if let Ok(n) = s.parse::<u64>() {
            Value::Int(n)
        } else {
            Value::Str(CompactString::from(s))
        }
    })
}

fn value<I>() -> impl Parser<I, Output = Value>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    choice((attempt(quoted().map(Value::Str)), attempt(addr_or_int())))
}

fn stmt<I>() -> impl Parser<I, Output = Stmt>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    choice((
        attempt(
            lex(string("next"))
                .with(optional(between(lex(char('(')), lex(char(')')), uint())))
                .map(|n| Stmt::Next(n.map(|n| n as u8))),
        ),
        attempt(lex(string("drop")).map(|_| Stmt::Drop)),
        attempt(
            lex(string("output"))
                .with(between(lex(char('(')), lex(char(')')), quoted()))
                .map(Stmt::Output),
        ),
        attempt(lex(string("ct_next")).map(|_| Stmt::CtNext)),
        attempt(lex(string("ct_commit")).map(|_| Stmt::CtCommit)),
        attempt(
            lex(string("ct_dnat"))
                .with(optional(between(lex(char('(')), lex(char(')')), value())))
                .map(Stmt::CtDnat),
        ),
        attempt(
            lex(string("ct_snat"))
                .with(optional(between(lex(char('(')), lex(char(')')), value())))
                .map(Stmt::CtSnat),
        ),
        attempt(
            (lex(string("reg")), uint(), lex(char('=')), value())
                .map(|(_, n, _, v)| Stmt::SetReg(n as u8, v)),
        ),
    ))
}

/// Parses a full action string (§4.4, §7 "parse error").
pub fn parse_actions(input: &str) -> anyhow::Result<ActionBuffer> {
    let mut p = spaces()
        .with(combine::sep_end_by(stmt(), lex(char(';'))))
        .skip(combine::eof());
    match p.parse(input) {
        Ok((stmts, rest)) if rest.is_empty() => Ok(ActionBuffer(stmts)),
        Ok((_, rest)) => anyhow::bail!("unconsumed input after actions: {rest:?}"),
        Err(e) => anyhow::bail!("action parse error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_next() {
        assert_eq!(parse_actions("next;").unwrap(), ActionBuffer(vec![Stmt::Next(None)]));
    }

    #[test]
    fn parses_drop() {
        assert_eq!(parse_actions("drop;").unwrap(), ActionBuffer(vec![Stmt::Drop]));
    }

    #[test]
    fn parses_multi_statement() {
        let buf = parse_actions("ct_commit; ct_snat(1.2.3.4); next(5);").unwrap();
        assert_eq!(
            buf,
            ActionBuffer(vec![
                Stmt::CtCommit,
                Stmt::CtSnat(Some(Value::Ipv4("1.2.3.4".parse().unwrap()))),
                Stmt::Next(Some(5)),
            ])
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_actions("bogus;").is_err());
    }
}
