//! Parser for template expressions.
//!
//! The grammar is a small, side effect free subset of JavaScript expressions: literals, member
//! access and calls, unary and binary operators, short-circuiting logic and the conditional
//! operator. Function values cannot be created, so there is no way to loop.

use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::bytes::complete::take_while;
use nom::character::complete::char;
use nom::character::complete::digit0;
use nom::character::complete::digit1;
use nom::character::complete::multispace0;
use nom::character::complete::one_of;
use nom::character::complete::satisfy;
use nom::combinator::all_consuming;
use nom::combinator::map;
use nom::combinator::map_res;
use nom::combinator::not;
use nom::combinator::opt;
use nom::combinator::recognize;
use nom::combinator::value;
use nom::multi::many0;
use nom::multi::separated_list0;
use nom::sequence::delimited;
use nom::sequence::pair;
use nom::sequence::preceded;
use nom::sequence::separated_pair;
use nom::sequence::terminated;
use nom::sequence::tuple;

use super::TemplateError;

/// Brackets may not nest deeper than this, and no more unary operators than this may follow
/// each other.
const MAX_NESTING: usize = 64;
/// Operators chain into nested expressions, so their count bounds the depth of the tree.
const MAX_OPERATORS: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    String(String),
    Template(Vec<TemplatePart>),
    Ident(String),
    Array(Vec<Element>),
    Object(Vec<Property>),
    /// Member accesses and calls applied left to right to a base expression.
    Chain(Box<Expr>, Vec<Access>),
    New(String, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TemplatePart {
    Text(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Element {
    Item(Expr),
    Spread(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Property {
    Entry(PropertyKey, Expr),
    Shorthand(String),
    Spread(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PropertyKey {
    Static(String),
    Computed(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Access {
    pub(crate) kind: AccessKind,
    /// `?.` access: a nullish receiver ends the whole chain with `undefined`.
    pub(crate) optional: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AccessKind {
    Property(String),
    Index(Expr),
    Call(Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
    Plus,
    TypeOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    StrictEq,
    StrictNe,
    LooseEq,
    LooseNe,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogicalOp {
    And,
    Or,
    Nullish,
}

/// Parses a complete expression.
pub(crate) fn parse_expression(source: &str) -> Result<Expr, TemplateError> {
    check_nesting(source)?;
    all_consuming(terminated(expression, multispace0))(source)
        .map(|(_, expr)| expr)
        .map_err(|error| TemplateError::Syntax {
            message: error.to_string(),
        })
}

fn check_nesting(source: &str) -> Result<(), TemplateError> {
    let mut depth = 0usize;
    let mut unary_run = 0usize;
    let mut operators = 0usize;
    let mut in_operator = false;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in source.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        match c {
            '!' | '-' | '+' => unary_run += 1,
            c if c.is_whitespace() => {}
            _ => unary_run = 0,
        }
        let is_operator = matches!(
            c,
            '?' | ':' | '&' | '|' | '+' | '-' | '*' | '/' | '%' | '<' | '>' | '=' | '!'
        );
        if is_operator && !in_operator {
            operators += 1;
        }
        in_operator = is_operator;
        if depth > MAX_NESTING || unary_run > MAX_NESTING || operators > MAX_OPERATORS {
            return Err(TemplateError::TooDeep);
        }
    }
    Ok(())
}

// Expression ::= Conditional
pub(crate) fn expression(input: &str) -> IResult<&str, Expr> {
    conditional(input)
}

// Conditional ::= Nullish ("?" Expression ":" Expression)?
fn conditional(input: &str) -> IResult<&str, Expr> {
    let (input, test) = nullish(input)?;
    let (input, branches) = opt(tuple((
        preceded(multispace0, terminated(char('?'), not(one_of("?.")))),
        expression,
        preceded(multispace0, char(':')),
        expression,
    )))(input)?;
    Ok(match branches {
        Some((_, consequent, _, alternate)) => (
            input,
            Expr::Conditional(Box::new(test), Box::new(consequent), Box::new(alternate)),
        ),
        None => (input, test),
    })
}

fn logical_chain<'a>(
    input: &'a str,
    operator: &'static str,
    op: LogicalOp,
    operand: fn(&str) -> IResult<&str, Expr>,
) -> IResult<&'a str, Expr> {
    let (input, first) = operand(input)?;
    let (input, rest) = many0(preceded(
        preceded(multispace0, tag(operator)),
        operand,
    ))(input)?;
    Ok((
        input,
        rest.into_iter().fold(first, |left, right| {
            Expr::Logical(op, Box::new(left), Box::new(right))
        }),
    ))
}

// Nullish ::= Or ("??" Or)*
fn nullish(input: &str) -> IResult<&str, Expr> {
    logical_chain(input, "??", LogicalOp::Nullish, or)
}

// Or ::= And ("||" And)*
fn or(input: &str) -> IResult<&str, Expr> {
    logical_chain(input, "||", LogicalOp::Or, and)
}

// And ::= Equality ("&&" Equality)*
fn and(input: &str) -> IResult<&str, Expr> {
    logical_chain(input, "&&", LogicalOp::And, equality)
}

fn binary_chain<'a>(
    input: &'a str,
    operator: fn(&str) -> IResult<&str, BinaryOp>,
    operand: fn(&str) -> IResult<&str, Expr>,
) -> IResult<&'a str, Expr> {
    let (input, first) = operand(input)?;
    let (input, rest) = many0(pair(preceded(multispace0, operator), operand))(input)?;
    Ok((
        input,
        rest.into_iter().fold(first, |left, (op, right)| {
            Expr::Binary(op, Box::new(left), Box::new(right))
        }),
    ))
}

// Equality ::= Relational (("===" | "!==" | "==" | "!=") Relational)*
fn equality(input: &str) -> IResult<&str, Expr> {
    binary_chain(
        input,
        |input| {
            alt((
                value(BinaryOp::StrictEq, tag("===")),
                value(BinaryOp::StrictNe, tag("!==")),
                value(BinaryOp::LooseEq, tag("==")),
                value(BinaryOp::LooseNe, tag("!=")),
            ))(input)
        },
        relational,
    )
}

// Relational ::= Additive (("<=" | ">=" | "<" | ">") Additive)*
fn relational(input: &str) -> IResult<&str, Expr> {
    binary_chain(
        input,
        |input| {
            alt((
                value(BinaryOp::Le, tag("<=")),
                value(BinaryOp::Ge, tag(">=")),
                value(BinaryOp::Lt, tag("<")),
                value(BinaryOp::Gt, tag(">")),
            ))(input)
        },
        additive,
    )
}

// Additive ::= Multiplicative (("+" | "-") Multiplicative)*
fn additive(input: &str) -> IResult<&str, Expr> {
    binary_chain(
        input,
        |input| {
            alt((
                value(BinaryOp::Add, char('+')),
                value(BinaryOp::Sub, char('-')),
            ))(input)
        },
        multiplicative,
    )
}

// Multiplicative ::= Unary (("*" | "/" | "%") Unary)*
fn multiplicative(input: &str) -> IResult<&str, Expr> {
    binary_chain(
        input,
        |input| {
            alt((
                value(BinaryOp::Mul, char('*')),
                value(BinaryOp::Div, char('/')),
                value(BinaryOp::Rem, char('%')),
            ))(input)
        },
        unary,
    )
}

// Unary ::= ("!" | "-" | "+" | "typeof") Unary | Postfix
fn unary(input: &str) -> IResult<&str, Expr> {
    let (input, _) = multispace0(input)?;
    alt((
        map(
            pair(
                alt((
                    value(UnaryOp::Not, char('!')),
                    value(UnaryOp::Neg, char('-')),
                    value(UnaryOp::Plus, char('+')),
                    value(UnaryOp::TypeOf, keyword("typeof")),
                )),
                unary,
            ),
            |(op, operand)| Expr::Unary(op, Box::new(operand)),
        ),
        postfix,
    ))(input)
}

// Postfix ::= Primary Access*
fn postfix(input: &str) -> IResult<&str, Expr> {
    let (input, base) = primary(input)?;
    let (input, accesses) = many0(access)(input)?;
    if accesses.is_empty() {
        Ok((input, base))
    } else {
        Ok((input, Expr::Chain(Box::new(base), accesses)))
    }
}

// Access ::= "?."? ("." Identifier | "[" Expression "]" | "(" Arguments ")")
fn access(input: &str) -> IResult<&str, Access> {
    preceded(
        multispace0,
        alt((
            map(
                preceded(
                    tag("?."),
                    alt((
                        map(preceded(multispace0, identifier), |name| {
                            AccessKind::Property(name.to_string())
                        }),
                        map(index, AccessKind::Index),
                        map(call_arguments, AccessKind::Call),
                    )),
                ),
                |kind| Access {
                    kind,
                    optional: true,
                },
            ),
            map(
                preceded(char('.'), preceded(multispace0, identifier)),
                |name| Access {
                    kind: AccessKind::Property(name.to_string()),
                    optional: false,
                },
            ),
            map(index, |expr| Access {
                kind: AccessKind::Index(expr),
                optional: false,
            }),
            map(call_arguments, |arguments| Access {
                kind: AccessKind::Call(arguments),
                optional: false,
            }),
        )),
    )(input)
}

fn index(input: &str) -> IResult<&str, Expr> {
    delimited(char('['), expression, preceded(multispace0, char(']')))(input)
}

// Arguments ::= (Expression ("," Expression)* ","?)?
fn call_arguments(input: &str) -> IResult<&str, Vec<Expr>> {
    delimited(
        preceded(multispace0, char('(')),
        terminated(separated_list0(comma, expression), opt(comma)),
        preceded(multispace0, char(')')),
    )(input)
}

fn comma(input: &str) -> IResult<&str, char> {
    preceded(multispace0, char(','))(input)
}

// Primary ::= Number | String | Template | Array | Object | "(" Expression ")" | Identifier
fn primary(input: &str) -> IResult<&str, Expr> {
    preceded(
        multispace0,
        alt((
            map(number, Expr::Number),
            map(string_literal, Expr::String),
            template_literal,
            array_literal,
            object_literal,
            delimited(char('('), expression, preceded(multispace0, char(')'))),
            identifier_expression,
        )),
    )(input)
}

fn identifier_expression(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = identifier(input)?;
    match name {
        "true" => Ok((rest, Expr::Bool(true))),
        "false" => Ok((rest, Expr::Bool(false))),
        "null" => Ok((rest, Expr::Null)),
        "undefined" => Ok((rest, Expr::Undefined)),
        "new" => map(
            pair(preceded(multispace0, identifier), call_arguments),
            |(callee, arguments)| Expr::New(callee.to_string(), arguments),
        )(rest),
        "typeof" => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        ))),
        _ => Ok((rest, Expr::Ident(name.to_string()))),
    }
}

// Identifier ::= [A-Za-z_$] [A-Za-z0-9_$]*
fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_' || c == '$'),
        take_while(is_identifier_char),
    ))(input)
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

fn keyword(word: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| terminated(tag(word), not(satisfy(is_identifier_char)))(input)
}

// Number ::= [0-9]+ ("." [0-9]*)? Exponent? | "." [0-9]+ Exponent?
fn number(input: &str) -> IResult<&str, f64> {
    let exponent = || opt(tuple((one_of("eE"), opt(one_of("+-")), digit1)));
    map_res(
        alt((
            recognize(tuple((digit1, opt(pair(char('.'), digit0)), exponent()))),
            recognize(tuple((char('.'), digit1, exponent()))),
        )),
        str::parse::<f64>,
    )(input)
}

// String ::= "'" ... "'" | '"' ... '"'
pub(crate) fn string_literal(input: &str) -> IResult<&str, String> {
    let mut input_char_indices = input.char_indices();
    match input_char_indices.next() {
        Some((0, quote @ '\'')) | Some((0, quote @ '"')) => {
            let mut chars = String::new();
            let mut escape_next = false;
            while let Some((i, c)) = input_char_indices.next() {
                if escape_next {
                    escape_next = false;
                    match c {
                        'u' => {
                            let (consumed, decoded) = unicode_escape(&input[i + 1..])?;
                            chars.push(decoded);
                            // Skip the hex digits.
                            for _ in 0..consumed {
                                input_char_indices.next();
                            }
                        }
                        _ => chars.push(escaped_char(c)),
                    }
                    continue;
                }
                if c == '\\' {
                    escape_next = true;
                    continue;
                }
                if c == quote {
                    return Ok((&input[i + 1..], chars));
                }
                chars.push(c);
            }
            Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Eof,
            )))
        }
        _ => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::IsNot,
        ))),
    }
}

fn escaped_char(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        'b' => '\u{8}',
        'f' => '\u{c}',
        'v' => '\u{b}',
        '0' => '\0',
        other => other,
    }
}

/// Decodes the four hex digits following `\u`, returning how many characters were consumed.
fn unicode_escape(input: &str) -> Result<(usize, char), nom::Err<nom::error::Error<&str>>> {
    input
        .get(..4)
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .and_then(char::from_u32)
        .map(|decoded| (4, decoded))
        .ok_or_else(|| {
            nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::HexDigit,
            ))
        })
}

// Template ::= "`" (Text | "${" Expression "}")* "`"
fn template_literal(input: &str) -> IResult<&str, Expr> {
    let (mut rest, _) = char('`')(input)?;
    let mut parts = Vec::new();
    let mut text = String::new();
    loop {
        let mut chars = rest.chars();
        match chars.next() {
            None => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Eof,
                )));
            }
            Some('`') => {
                if !text.is_empty() {
                    parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                }
                return Ok((chars.as_str(), Expr::Template(parts)));
            }
            Some('\\') => match chars.next() {
                Some(c) => {
                    text.push(escaped_char(c));
                    rest = chars.as_str();
                }
                None => {
                    return Err(nom::Err::Error(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::Eof,
                    )));
                }
            },
            Some('$') if chars.as_str().starts_with('{') => {
                if !text.is_empty() {
                    parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                }
                let (after, expr) = delimited(
                    tag("${"),
                    expression,
                    preceded(multispace0, char('}')),
                )(rest)?;
                parts.push(TemplatePart::Expr(expr));
                rest = after;
            }
            Some(c) => {
                text.push(c);
                rest = chars.as_str();
            }
        }
    }
}

// Array ::= "[" (Element ("," Element)* ","?)? "]"
fn array_literal(input: &str) -> IResult<&str, Expr> {
    map(
        delimited(
            char('['),
            terminated(separated_list0(comma, element), opt(comma)),
            preceded(multispace0, char(']')),
        ),
        Expr::Array,
    )(input)
}

// Element ::= "..." Expression | Expression
fn element(input: &str) -> IResult<&str, Element> {
    alt((
        map(preceded(spread, expression), Element::Spread),
        map(expression, Element::Item),
    ))(input)
}

fn spread(input: &str) -> IResult<&str, &str> {
    preceded(multispace0, tag("..."))(input)
}

// Object ::= "{" (Property ("," Property)* ","?)? "}"
fn object_literal(input: &str) -> IResult<&str, Expr> {
    map(
        delimited(
            char('{'),
            terminated(separated_list0(comma, property), opt(comma)),
            preceded(multispace0, char('}')),
        ),
        Expr::Object,
    )(input)
}

// Property ::= "..." Expression | PropertyKey ":" Expression | Identifier
fn property(input: &str) -> IResult<&str, Property> {
    preceded(
        multispace0,
        alt((
            map(preceded(tag("..."), expression), Property::Spread),
            map(
                separated_pair(property_key, preceded(multispace0, char(':')), expression),
                |(key, value)| Property::Entry(key, value),
            ),
            map(identifier, |name| Property::Shorthand(name.to_string())),
        )),
    )(input)
}

// PropertyKey ::= Identifier | String | Number | "[" Expression "]"
fn property_key(input: &str) -> IResult<&str, PropertyKey> {
    alt((
        map(identifier, |name| PropertyKey::Static(name.to_string())),
        map(string_literal, PropertyKey::Static),
        map(number, |n| {
            PropertyKey::Static(super::eval::number_to_string(n))
        }),
        map(index, PropertyKey::Computed),
    ))(input)
}
