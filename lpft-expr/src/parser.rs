//! Recursive-descent match-string parser (§4.3 step 1), built the way the
//! expression library's own parser is: `combine` combinators wired up
//! through the `parser!` macro for the mutually-recursive grammar rules.
//!
//! Grammar (lowest to highest precedence):
//! ```text
//! expr       := or_expr
//! or_expr    := and_expr ("||" and_expr)*
//! and_expr   := unary_expr ("&&" unary_expr)*
//! unary_expr := "!" unary_expr | atom
//! atom       := "(" expr ")" | "is_chassis_resident" "(" STRING ")" | comparison
//! comparison := FIELD OP value
//! OP         := "==" | "!=" | "<=" | ">=" | "<" | ">"
//! value      := IPV4 | IPV6 | MAC | INT | STRING | "$" IDENT
//! ```

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use combine::parser::char::{char, spaces, string};
use combine::{attempt, between, chainl1, choice, many, many1, satisfy, ParseError, Parser, Stream};
use compact_str::CompactString;

use crate::ast::{CmpOp, Expr, Value};

fn lex<I, P>(p: P) -> impl Parser<I, Output = P::Output>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
    P: Parser<I>,
{
    p.skip(spaces())
}

fn ident<I>() -> impl Parser<I, Output = CompactString>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    lex(many1(satisfy(|c: char| c.is_alphanumeric() || c == '_' || c == '.')))
        .map(|s: String| CompactString::from(s))
}

fn quoted_string<I>() -> impl Parser<I, Output = CompactString>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    lex(between(char('"'), char('"'), many(satisfy(|c: char| c != '"'))))
        .map(|s: String| CompactString::from(s))
}

/// A bare token of `[0-9a-fA-F:.]`, disambiguated afterwards into an
/// IPv4/IPv6/MAC/plain integer literal.
fn addr_token<I>() -> impl Parser<I, Output = String>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    lex(many1(satisfy(|c: char| c.is_ascii_hexdigit() || c == ':' || c == '.')))
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut out = [0u8; 6];
    for (i, p) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(p, 16).ok()?;
    }
    Some(out)
}

fn value_literal<I>() -> impl Parser<I, Output = Value>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    addr_token().map(|s| {
        if let Ok(v4) = Ipv4Addr::from_str(&s) {
            Value::Ipv4(v4)
        } else if let Some(mac) = parse_mac(&s) {
            Value::Mac(mac)
        } else if let Ok(v6) = Ipv6Addr::from_str(&s) {
            Value::Ipv6(v6)
        } else if let Ok(n) = s.parse::<u64>() {
            Value::Int(n)
        } else {
            // falls through to string-valued comparisons (e.g. a bare
            // identifier used as a symbolic literal).
            Value::Str(CompactString::from(s))
        }
    })
}

fn set_ref<I>() -> impl Parser<I, Output = Value>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    lex(char('$')).with(ident()).map(Value::SetRef)
}

fn value<I>() -> impl Parser<I, Output = Value>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    choice((
        attempt(set_ref()),
        attempt(quoted_string().map(Value::Str)),
        attempt(value_literal()),
    ))
}

fn cmp_op<I>() -> impl Parser<I, Output = CmpOp>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    choice((
        attempt(lex(string("==")).map(|_| CmpOp::Eq)),
        attempt(lex(string("!=")).map(|_| CmpOp::Ne)),
        attempt(lex(string("<=")).map(|_| CmpOp::Le)),
        attempt(lex(string(">=")).map(|_| CmpOp::Ge)),
        attempt(lex(char('<')).map(|_| CmpOp::Lt)),
        attempt(lex(char('>')).map(|_| CmpOp::Gt)),
    ))
}

fn comparison<I>() -> impl Parser<I, Output = Expr>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    (ident(), cmp_op(), value()).map(|(field, op, value)| Expr::Cmp { field, op, value })
}

fn chassis_resident<I>() -> impl Parser<I, Output = Expr>
where
    I: Stream<Token = char>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    lex(string("is_chassis_resident"))
        .with(between(lex(char('(')), lex(char(')')), quoted_string()))
        .map(Expr::ChassisResident)
}

combine::parser! {
    fn atom[I]()(I) -> Expr
    where [I: Stream<Token = char>, I::Error: ParseError<I::Token, I::Range, I::Position>]
    {
        choice((
            attempt(chassis_resident()),
            attempt(between(lex(char('(')), lex(char(')')), expr())),
            attempt(comparison()),
        ))
    }
}

combine::parser! {
    fn unary_expr[I]()(I) -> Expr
    where [I: Stream<Token = char>, I::Error: ParseError<I::Token, I::Range, I::Position>]
    {
        choice((
            attempt(lex(char('!')).with(unary_expr()).map(|e| Expr::Not(Box::new(e)))),
            atom(),
        ))
    }
}

combine::parser! {
    fn and_expr[I]()(I) -> Expr
    where [I: Stream<Token = char>, I::Error: ParseError<I::Token, I::Range, I::Position>]
    {
        chainl1(
            unary_expr(),
            lex(string("&&")).map(|_| |a, b| Expr::And(Box::new(a), Box::new(b))),
        )
    }
}

combine::parser! {
    fn or_expr[I]()(I) -> Expr
    where [I: Stream<Token = char>, I::Error: ParseError<I::Token, I::Range, I::Position>]
    {
        chainl1(
            and_expr(),
            lex(string("||")).map(|_| |a, b| Expr::Or(Box::new(a), Box::new(b))),
        )
    }
}

combine::parser! {
    fn expr[I]()(I) -> Expr
    where [I: Stream<Token = char>, I::Error: ParseError<I::Token, I::Range, I::Position>]
    {
        or_expr()
    }
}

/// Parses a full match string (§4.3 step 1). Trailing garbage is a parse
/// error (§7 "parse error").
pub fn parse_match(input: &str) -> anyhow::Result<Expr> {
    let mut p = spaces().with(expr()).skip(spaces()).skip(combine::eof());
    match p.parse(input) {
        Ok((e, rest)) if rest.is_empty() => Ok(e),
        Ok((_, rest)) => anyhow::bail!("unconsumed input after match expression: {rest:?}"),
        Err(e) => anyhow::bail!("match parse error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_comparison() {
        let e = parse_match("ip4.dst==10.0.0.1").unwrap();
        assert_eq!(
            e,
            Expr::Cmp {
                field: "ip4.dst".into(),
                op: CmpOp::Eq,
                value: Value::Ipv4(Ipv4Addr::new(10, 0, 0, 1)),
            }
        );
    }

    #[test]
    fn parses_and_or_precedence() {
        let e = parse_match("ip.proto==6 && ip4.src==1.1.1.1 || ip.proto==17").unwrap();
        // `&&` binds tighter than `||`.
        match e {
            Expr::Or(lhs, rhs) => {
                assert!(matches!(*lhs, Expr::And(..)));
                assert!(matches!(*rhs, Expr::Cmp { .. }));
            }
            other => panic!("expected top-level Or, got {other:?}"),
        }
    }

    #[test]
    fn parses_set_ref() {
        let e = parse_match("ip4.src==$a").unwrap();
        assert_eq!(
            e,
            Expr::Cmp { field: "ip4.src".into(), op: CmpOp::Eq, value: Value::SetRef("a".into()) }
        );
    }

    #[test]
    fn parses_chassis_resident() {
        let e = parse_match("is_chassis_resident(\"p1\")").unwrap();
        assert_eq!(e, Expr::ChassisResident("p1".into()));
    }

    #[test]
    fn parses_negation_and_parens() {
        let e = parse_match("!(ip.proto==6)").unwrap();
        assert!(matches!(e, Expr::Not(_)));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse_match("ip.proto==6 ;;;").is_err());
    }
}
