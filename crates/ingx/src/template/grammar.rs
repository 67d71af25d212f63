//! 📜 The template grammar: lexing strings like `DD:*station:&round|2:*temp` into tokens.
//!
//! Four kinds of token, recognized left to right:
//!
//! - `&name|a,b:s1:s2` → [`Token::Function`]. The name runs up to `|` (or the first `:`),
//!   the argument list runs up to the first `:`, and everything after that is sub-tokens.
//! - `*name` → [`Token::Variable`].
//! - anything else → [`Token::Literal`].
//! - colon-separated pieces outside a function → [`Token::Composite`].
//!
//! A function swallows the rest of the string, so inside a composite it is always the last piece.

use super::TemplateError;

pub const VARIABLE_MARKER: char = '*';
pub const FUNCTION_MARKER: char = '&';
pub const ARGUMENT_SEPARATOR: char = '|';
pub const ARGUMENT_DELIMITER: char = ',';
pub const COMPOSITE_SEPARATOR: char = ':';

/// 🧱 One parsed piece of a template string.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Literal(String),
    Variable(String),
    Function(FunctionCall),
    Composite(Vec<Token>),
}

/// 🎯 A handler invocation: name, argument tokens, sub-tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<Token>,
    pub subtokens: Vec<Token>,
}

/// 🔄 Parse one template string into a token.
///
/// An empty string is an empty literal, not an error. Malformed input (an empty handler
/// name, a bare `*`, a function inside an argument list) fails with [`TemplateError::Malformed`].
pub fn parse(template: &str) -> Result<Token, TemplateError> {
    if template.is_empty() {
        return Ok(Token::Literal(String::new()));
    }
    let mut pieces = parse_pieces(template, template)?;
    if pieces.len() == 1 {
        // -- ✅ a lone piece is itself; no composite wrapper for a party of one
        return Ok(pieces.remove(0));
    }
    Ok(Token::Composite(pieces))
}

/// Splits on `:` until a function marker shows up, then hands the remainder to the function.
fn parse_pieces(source: &str, whole: &str) -> Result<Vec<Token>, TemplateError> {
    let mut pieces = Vec::new();
    let mut rest = source;
    loop {
        if rest.starts_with(FUNCTION_MARKER) {
            pieces.push(parse_function(rest, whole)?);
            return Ok(pieces);
        }
        match rest.find(COMPOSITE_SEPARATOR) {
            Some(at) => {
                pieces.push(parse_atom(&rest[..at], whole)?);
                rest = &rest[at + 1..];
            }
            None => {
                pieces.push(parse_atom(rest, whole)?);
                return Ok(pieces);
            }
        }
    }
}

fn parse_function(source: &str, whole: &str) -> Result<Token, TemplateError> {
    let body = &source[FUNCTION_MARKER.len_utf8()..];
    let (header, remainder) = match body.find(COMPOSITE_SEPARATOR) {
        Some(at) => (&body[..at], Some(&body[at + 1..])),
        None => (body, None),
    };
    let (name, arg_list) = match header.find(ARGUMENT_SEPARATOR) {
        Some(at) => (&header[..at], Some(&header[at + 1..])),
        None => (header, None),
    };
    if name.is_empty() {
        return Err(malformed(whole, "a function marker must be followed by a handler name"));
    }

    let mut args = Vec::new();
    if let Some(arg_list) = arg_list.filter(|list| !list.is_empty()) {
        for raw_arg in arg_list.split(ARGUMENT_DELIMITER) {
            if raw_arg.starts_with(FUNCTION_MARKER) {
                return Err(malformed(
                    whole,
                    "functions cannot be nested inside an argument list; use a sub-token",
                ));
            }
            args.push(parse_atom(raw_arg, whole)?);
        }
    }

    let subtokens = match remainder {
        Some(rest) if !rest.is_empty() => parse_pieces(rest, whole)?,
        _ => Vec::new(),
    };

    Ok(Token::Function(FunctionCall {
        name: name.to_string(),
        args,
        subtokens,
    }))
}

fn parse_atom(piece: &str, whole: &str) -> Result<Token, TemplateError> {
    match piece.strip_prefix(VARIABLE_MARKER) {
        Some("") => Err(malformed(whole, "a variable marker must be followed by a name")),
        Some(name) => Ok(Token::Variable(name.to_string())),
        None => Ok(Token::Literal(piece.to_string())),
    }
}

fn malformed(whole: &str, reason: &str) -> TemplateError {
    TemplateError::Malformed {
        template: whole.to_string(),
        reason: reason.to_string(),
    }
}

impl Token {
    /// 📋 Every handler name this token (and its children) will call, depth-first.
    pub fn handler_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_handler_names(&mut names);
        names
    }

    fn collect_handler_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Token::Literal(_) | Token::Variable(_) => {}
            Token::Function(call) => {
                names.push(call.name.as_str());
                for token in call.args.iter().chain(call.subtokens.iter()) {
                    token.collect_handler_names(names);
                }
            }
            Token::Composite(pieces) => {
                for piece in pieces {
                    piece.collect_handler_names(names);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(s: &str) -> Token {
        Token::Literal(s.to_string())
    }

    fn var(s: &str) -> Token {
        Token::Variable(s.to_string())
    }

    #[test]
    fn the_one_where_a_plain_word_stays_a_literal() {
        assert_eq!(parse("METAR").unwrap(), lit("METAR"));
    }

    #[test]
    fn the_one_where_empty_is_just_an_empty_literal() {
        assert_eq!(parse("").unwrap(), lit(""));
    }

    #[test]
    fn the_one_where_a_star_makes_a_variable() {
        assert_eq!(parse("*station_name").unwrap(), var("station_name"));
    }

    #[test]
    fn the_one_where_colons_build_a_composite() {
        assert_eq!(
            parse("DD:V01:*station:obs").unwrap(),
            Token::Composite(vec![lit("DD"), lit("V01"), var("station"), lit("obs")])
        );
    }

    #[test]
    fn the_one_where_a_function_takes_args_and_subtokens() {
        let token = parse("&derive_key|PREFIX:*station_name:*fcst_hour").unwrap();
        assert_eq!(
            token,
            Token::Function(FunctionCall {
                name: "derive_key".into(),
                args: vec![lit("PREFIX")],
                subtokens: vec![var("station_name"), var("fcst_hour")],
            })
        );
    }

    #[test]
    fn the_one_where_a_function_closes_out_a_composite() {
        let token = parse("DD:V01:&interval_start|3600:*epoch").unwrap();
        let Token::Composite(pieces) = token else {
            panic!("💀 expected a composite");
        };
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0], lit("DD"));
        assert_eq!(
            pieces[2],
            Token::Function(FunctionCall {
                name: "interval_start".into(),
                args: vec![lit("3600")],
                subtokens: vec![var("epoch")],
            })
        );
    }

    #[test]
    fn the_one_where_functions_nest_through_subtokens() {
        let token = parse("&upper:&coalesce:*name:*icao").unwrap();
        assert_eq!(token.handler_names(), vec!["upper", "coalesce"]);
    }

    #[test]
    fn the_one_where_comma_separated_args_can_be_variables() {
        let token = parse("&valid_epoch|*field,3600").unwrap();
        let Token::Function(call) = token else {
            panic!("💀 expected a function");
        };
        assert_eq!(call.args, vec![var("field"), lit("3600")]);
        assert!(call.subtokens.is_empty());
    }

    #[test]
    fn the_one_where_a_nameless_function_is_malformed() {
        assert!(matches!(parse("&|x:*y"), Err(TemplateError::Malformed { .. })));
        assert!(matches!(parse("DD:&"), Err(TemplateError::Malformed { .. })));
    }

    #[test]
    fn the_one_where_a_bare_star_is_malformed() {
        assert!(matches!(parse("DD:*:obs"), Err(TemplateError::Malformed { .. })));
    }

    #[test]
    fn the_one_where_functions_in_arg_lists_are_rejected() {
        assert!(matches!(parse("&round|&x:*t"), Err(TemplateError::Malformed { .. })));
    }
}
