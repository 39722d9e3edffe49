// Named Parameter Binding
// Rewrites `:name` placeholders into each driver's native placeholder style

use serde_json::Value;

use super::traits::{DatabaseError, QueryParams};

/// Placeholder syntax understood by a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1, $2, ...` with repeated names sharing one index (tokio-postgres)
    Dollar,
    /// `?` per occurrence (MySQL)
    Question,
    /// `:name` left in place (Oracle)
    Named,
}

/// SQL rewritten for a driver plus the values to bind, in bind order
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub values: Vec<Value>,
    /// Parameter name for each entry in `values`
    pub names: Vec<String>,
}

impl BoundStatement {
    fn unbound(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            values: Vec::new(),
            names: Vec::new(),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Bind named parameters for `style`.
///
/// Placeholders inside quoted text, quoted identifiers and comments are left
/// alone, as are `::` casts. A placeholder with no matching parameter is an
/// error; parameters the statement never references are ignored.
pub fn bind_named(
    sql: &str,
    params: Option<&QueryParams>,
    style: PlaceholderStyle,
) -> Result<BoundStatement, DatabaseError> {
    if !sql.contains(':') {
        return Ok(BoundStatement::unbound(sql));
    }

    let empty = QueryParams::new();
    let params = params.unwrap_or(&empty);

    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let mut names: Vec<String> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                // Copy through to the matching close quote; doubled quotes
                // re-enter the loop as a fresh literal, which is equivalent.
                out.push(c);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == c {
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                out.push_str("/*");
                i += 2;
                while i < chars.len() {
                    if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        out.push_str("*/");
                        i += 2;
                        break;
                    }
                    out.push(chars[i]);
                    i += 1;
                }
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                out.push_str("::");
                i += 2;
            }
            ':' if chars.get(i + 1).copied().is_some_and(is_ident_start) => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let value = params.get(&name).ok_or_else(|| {
                    DatabaseError::QueryError(format!(
                        "A value is required for bind parameter '{}'",
                        name
                    ))
                })?;

                match style {
                    PlaceholderStyle::Dollar => {
                        let index = match names.iter().position(|n| n == &name) {
                            Some(pos) => pos + 1,
                            None => {
                                names.push(name);
                                values.push(value.clone());
                                names.len()
                            }
                        };
                        out.push('$');
                        out.push_str(&index.to_string());
                    }
                    PlaceholderStyle::Question => {
                        out.push('?');
                        names.push(name);
                        values.push(value.clone());
                    }
                    PlaceholderStyle::Named => {
                        out.push(':');
                        out.push_str(&name);
                        if !names.contains(&name) {
                            names.push(name);
                            values.push(value.clone());
                        }
                    }
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(BoundStatement {
        sql: out,
        values,
        names,
    })
}
