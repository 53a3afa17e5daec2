//! Expression language for task conditions and `${...}` interpolation.
//!
//! Side-effect-free: scope lookups, literals, comparisons, logical
//! operators, property access and a small builtin function set. Unknown
//! references evaluate to [`Value::Undefined`] rather than raising, so a
//! `when` guard over a register that was never set is simply false.

mod eval;
mod lexer;
mod parser;
mod value;

pub use eval::Scope;
pub use parser::ParseError;
pub use value::Value;

use parser::Ast;

/// A parsed, reusable expression.
///
/// Parsing happens once (at config load); evaluation is total and cannot
/// fail at runtime.
#[derive(Debug, Clone)]
pub struct Expr {
    ast: Ast,
    source: String,
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let tokens = lexer::tokenize(source)?;
        let ast = parser::parse(&tokens, source)?;
        Ok(Expr {
            ast,
            source: source.to_string(),
        })
    }

    pub fn eval(&self, scope: &dyn Scope) -> Value {
        eval::eval(&self.ast, scope)
    }

    /// Evaluate and collapse to a boolean (`when` semantics).
    pub fn eval_bool(&self, scope: &dyn Scope) -> bool {
        self.eval(scope).truthy()
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// A string template with embedded `${expr}` segments.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
    source: String,
}

#[derive(Debug, Clone)]
enum Segment {
    Text(String),
    Expr(Expr),
}

impl Template {
    /// Parse a template, validating every embedded expression. A literal
    /// `$$` escapes a dollar sign.
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let bytes = source.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'$' {
                text.push('$');
                i += 2;
            } else if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                let start = i + 2;
                let mut depth = 1usize;
                let mut end = start;
                while end < bytes.len() {
                    match bytes[end] {
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    end += 1;
                }
                if depth != 0 {
                    return Err(ParseError::new(
                        source,
                        i,
                        "unterminated ${...} interpolation",
                    ));
                }
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Expr(Expr::parse(&source[start..end])?));
                i = end + 1;
            } else {
                // safe: iterating byte-wise but pushing whole chars
                let ch = source[i..].chars().next().unwrap_or('\u{fffd}');
                text.push(ch);
                i += ch.len_utf8();
            }
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        Ok(Template {
            segments,
            source: source.to_string(),
        })
    }

    /// True if the template contains no `${...}` segments.
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Text(_)))
    }

    /// Render against a scope. Undefined expressions render as the empty
    /// string.
    pub fn render(&self, scope: &dyn Scope) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Expr(e) => out.push_str(&e.eval(scope).render()),
            }
        }
        out
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// One-shot convenience: parse and render a template.
pub fn interpolate(template: &str, scope: &dyn Scope) -> Result<String, ParseError> {
    Ok(Template::parse(template)?.render(scope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn scope(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn undefined_reference_is_falsy() {
        let s = scope(&[]);
        assert!(!Expr::parse("nope").unwrap().eval_bool(&s));
        assert!(!Expr::parse("nope.stdout == \"x\"").unwrap().eval_bool(&s));
    }

    #[test]
    fn comparisons_and_logic() {
        let s = scope(&[
            ("count", Value::Number(3.0)),
            ("env", Value::Str("staging".into())),
        ]);
        assert!(Expr::parse("count >= 3 && env == 'staging'")
            .unwrap()
            .eval_bool(&s));
        assert!(Expr::parse("count < 3 || env != 'prod'")
            .unwrap()
            .eval_bool(&s));
        assert!(!Expr::parse("!(count == 3)").unwrap().eval_bool(&s));
    }

    #[test]
    fn property_access() {
        let mut reg = BTreeMap::new();
        reg.insert("stdout".to_string(), Value::Str("staging\n".into()));
        reg.insert("exitCode".to_string(), Value::Number(0.0));
        let s = scope(&[("check", Value::Map(reg))]);
        assert!(Expr::parse("trim(check.stdout) == 'staging'")
            .unwrap()
            .eval_bool(&s));
        assert!(Expr::parse("check.exitCode == 0").unwrap().eval_bool(&s));
        assert!(!Expr::parse("check.missing").unwrap().eval_bool(&s));
    }

    #[test]
    fn builtins() {
        let s = scope(&[
            ("msg", Value::Str("hello world".into())),
            (
                "hosts",
                Value::List(vec![Value::Str("a".into()), Value::Str("b".into())]),
            ),
        ]);
        assert!(Expr::parse("includes(msg, 'world')").unwrap().eval_bool(&s));
        assert!(Expr::parse("includes(hosts, 'b')").unwrap().eval_bool(&s));
        assert!(Expr::parse("startsWith(msg, 'hello')")
            .unwrap()
            .eval_bool(&s));
        assert_eq!(
            Expr::parse("length(hosts)").unwrap().eval(&s),
            Value::Number(2.0)
        );
        assert_eq!(
            Expr::parse("default(nope, 'fallback')").unwrap().eval(&s),
            Value::Str("fallback".into())
        );
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(Expr::parse("a &&").is_err());
        assert!(Expr::parse("includes(a").is_err());
        assert!(Expr::parse("'unterminated").is_err());
        assert!(Expr::parse("a ? b : c").is_err());
    }

    #[test]
    fn template_render() {
        let s = scope(&[("name", Value::Str("web-1".into()))]);
        assert_eq!(
            interpolate("deploy ${name} to $$HOME", &s).unwrap(),
            "deploy web-1 to $HOME"
        );
        assert_eq!(interpolate("${missing}", &s).unwrap(), "");
        assert!(Template::parse("${unterminated").is_err());
    }

    #[test]
    fn template_literal_detection() {
        assert!(Template::parse("plain text").unwrap().is_literal());
        assert!(!Template::parse("a ${b} c").unwrap().is_literal());
    }
}
