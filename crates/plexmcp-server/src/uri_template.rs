//! RFC 6570 URI templates, level 1 and 2, plus path-segment expansion.
//!
//! Supports `{var}` (simple), `{+var}` (reserved), `{#var}` (fragment),
//! and `{/var}` (path segment). Templates are bidirectional: `expand`
//! substitutes variables, `match_uri` recovers them from a concrete URI.

use std::collections::HashMap;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use plexmcp_protocol::error::{Error, Result};

/// Characters escaped by simple expansion (everything but unreserved)
const SIMPLE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b':')
    .add(b'&')
    .add(b'=')
    .add(b'+')
    .add(b',')
    .add(b'!')
    .add(b'@')
    .add(b'|')
    .add(b'^')
    .add(b'[')
    .add(b']');

/// Characters escaped by reserved expansion (reserved set passes through)
const RESERVED: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    /// `{var}`
    Simple,
    /// `{+var}`
    Reserved,
    /// `{#var}`
    Fragment,
    /// `{/var}`
    PathSegment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Expression { operator: Operator, variable: String },
}

/// A parsed URI template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    source: String,
    parts: Vec<Part>,
}

impl UriTemplate {
    /// Parse a template string
    pub fn parse(template: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '{' {
                if c == '}' {
                    return Err(Error::invalid_params(format!(
                        "unbalanced '}}' in template: {template}"
                    )));
                }
                literal.push(c);
                continue;
            }
            if !literal.is_empty() {
                parts.push(Part::Literal(std::mem::take(&mut literal)));
            }
            let mut expr = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                expr.push(c);
            }
            if !closed {
                return Err(Error::invalid_params(format!(
                    "unterminated expression in template: {template}"
                )));
            }
            let (operator, variable) = match expr.chars().next() {
                Some('+') => (Operator::Reserved, &expr[1..]),
                Some('#') => (Operator::Fragment, &expr[1..]),
                Some('/') => (Operator::PathSegment, &expr[1..]),
                _ => (Operator::Simple, expr.as_str()),
            };
            if variable.is_empty()
                || !variable
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(Error::invalid_params(format!(
                    "invalid variable name '{variable}' in template: {template}"
                )));
            }
            parts.push(Part::Expression {
                operator,
                variable: variable.to_string(),
            });
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(Self {
            source: template.to_string(),
            parts,
        })
    }

    /// The original template string
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Variable names in order of appearance
    pub fn variables(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Expression { variable, .. } => Some(variable.as_str()),
                Part::Literal(_) => None,
            })
            .collect()
    }

    /// Expand the template with the given variable values.
    ///
    /// Missing variables expand to nothing, as RFC 6570 prescribes.
    pub fn expand(&self, vars: &HashMap<String, String>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Expression { operator, variable } => {
                    let Some(value) = vars.get(variable) else {
                        continue;
                    };
                    match operator {
                        Operator::Simple => {
                            out.push_str(&utf8_percent_encode(value, SIMPLE).to_string());
                        }
                        Operator::Reserved => {
                            out.push_str(&utf8_percent_encode(value, RESERVED).to_string());
                        }
                        Operator::Fragment => {
                            out.push('#');
                            out.push_str(&utf8_percent_encode(value, RESERVED).to_string());
                        }
                        Operator::PathSegment => {
                            out.push('/');
                            out.push_str(&utf8_percent_encode(value, SIMPLE).to_string());
                        }
                    }
                }
            }
        }
        out
    }

    /// Match a concrete URI against the template, recovering variables.
    ///
    /// Returns `None` when the URI does not fit the template shape.
    pub fn match_uri(&self, uri: &str) -> Option<HashMap<String, String>> {
        let mut vars = HashMap::new();
        let mut rest = uri;
        let mut iter = self.parts.iter().peekable();
        while let Some(part) = iter.next() {
            match part {
                Part::Literal(text) => {
                    rest = rest.strip_prefix(text.as_str())?;
                }
                Part::Expression { operator, variable } => {
                    let mut candidate = rest;
                    match operator {
                        Operator::Fragment => {
                            candidate = rest.strip_prefix('#')?;
                        }
                        Operator::PathSegment => {
                            candidate = rest.strip_prefix('/')?;
                        }
                        Operator::Simple | Operator::Reserved => {}
                    }
                    // The capture runs until the next literal (or the end).
                    let until = match iter.peek() {
                        Some(Part::Literal(next)) => candidate.find(next.as_str())?,
                        Some(Part::Expression { operator, .. }) => match operator {
                            Operator::Fragment => candidate.find('#')?,
                            Operator::PathSegment => candidate.find('/')?,
                            _ => candidate.len(),
                        },
                        None => candidate.len(),
                    };
                    let (captured, remaining) = candidate.split_at(until);
                    // Simple and path-segment values never span segments.
                    if matches!(operator, Operator::Simple | Operator::PathSegment)
                        && captured.contains('/')
                    {
                        return None;
                    }
                    if captured.is_empty() {
                        return None;
                    }
                    let decoded = percent_decode_str(captured)
                        .decode_utf8()
                        .ok()?
                        .into_owned();
                    vars.insert(variable.clone(), decoded);
                    rest = remaining;
                }
            }
        }
        rest.is_empty().then_some(vars)
    }
}

impl std::fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn simple_expansion_escapes() {
        let template = UriTemplate::parse("db://{table}/schema").unwrap();
        assert_eq!(
            template.expand(&vars(&[("table", "users roles")])),
            "db://users%20roles/schema"
        );
    }

    #[test]
    fn reserved_expansion_keeps_slashes() {
        let template = UriTemplate::parse("file://{+path}").unwrap();
        assert_eq!(
            template.expand(&vars(&[("path", "/home/u/readme.md")])),
            "file:///home/u/readme.md"
        );
    }

    #[test]
    fn path_segment_expansion() {
        let template = UriTemplate::parse("api://v1{/version}").unwrap();
        assert_eq!(template.expand(&vars(&[("version", "beta")])), "api://v1/beta");
    }

    #[test]
    fn round_trip_expand_then_match() {
        let template = UriTemplate::parse("db://{table}/rows/{id}").unwrap();
        let input = vars(&[("table", "users"), ("id", "42")]);
        let uri = template.expand(&input);
        let matched = template.match_uri(&uri).unwrap();
        assert_eq!(matched, input);
    }

    #[test]
    fn match_rejects_wrong_shape() {
        let template = UriTemplate::parse("db://{table}/rows/{id}").unwrap();
        assert!(template.match_uri("db://users/columns/42").is_none());
        assert!(template.match_uri("file://users/rows/42").is_none());
        assert!(template.match_uri("db://users/rows/42/extra").is_none());
    }

    #[test]
    fn simple_var_does_not_cross_segments() {
        let template = UriTemplate::parse("db://{table}").unwrap();
        assert!(template.match_uri("db://a/b").is_none());
        let template = UriTemplate::parse("file://{+path}").unwrap();
        assert_eq!(
            template.match_uri("file:///home/u").unwrap()["path"],
            "/home/u"
        );
    }

    #[test]
    fn match_decodes_percent_sequences() {
        let template = UriTemplate::parse("db://{table}/schema").unwrap();
        let matched = template.match_uri("db://users%20roles/schema").unwrap();
        assert_eq!(matched["table"], "users roles");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(UriTemplate::parse("db://{table").is_err());
        assert!(UriTemplate::parse("db://table}").is_err());
        assert!(UriTemplate::parse("db://{ta ble}").is_err());
        assert!(UriTemplate::parse("db://{}").is_err());
    }
}
