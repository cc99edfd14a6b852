//! SQL Identifier Sanitization Utilities
//!
//! Quoting of identifiers and literals, and translation of dot-notation field
//! names into JSON path expressions.

use std::sync::LazyLock;

use regex::Regex;

static CLASS_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^_?[A-Za-z][A-Za-z0-9_]*$").expect("valid class name regex"));

static JOIN_CLASS_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^_Join:[A-Za-z0-9_]+:[A-Za-z0-9_]+$").expect("valid join name regex")
});

/// Quote a SQL identifier to make it safe for use in queries
///
/// # Example
/// ```
/// use postgres_storage_adapter::sql::quote_identifier;
///
/// let quoted = quote_identifier("_Join:friends:_User");
/// assert_eq!(quoted, "\"_Join:friends:_User\"");
/// ```
pub fn quote_identifier(identifier: &str) -> String {
    // Escape any double quotes in the identifier by doubling them
    let escaped = identifier.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Quote a string as a SQL literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Validate a class or join table name
pub fn validate_class_name(name: &str) -> Result<(), String> {
    if CLASS_NAME.is_match(name) || JOIN_CLASS_NAME.is_match(name) {
        Ok(())
    } else {
        Err(format!(
            "Invalid class name: {}. Class names must start with a letter and contain only letters, numbers and underscores.",
            name
        ))
    }
}

fn is_array_index(component: &str) -> bool {
    !component.is_empty() && component.chars().all(|c| c.is_ascii_digit())
}

/// Split a dotted field name into JSON path components
///
/// The first component is the quoted column, the rest are quoted keys or bare
/// array indexes.
pub fn transform_dot_field_to_components(field_name: &str) -> Vec<String> {
    field_name
        .split('.')
        .enumerate()
        .map(|(index, component)| {
            if index == 0 {
                quote_identifier(component)
            } else if is_array_index(component) {
                component.to_string()
            } else {
                quote_literal(component)
            }
        })
        .collect()
}

/// JSON path expression returning the nested value as text
///
/// `a.b.c` becomes `"a"->'b'->>'c'`; a plain name is just quoted.
pub fn transform_dot_field(field_name: &str) -> String {
    if !field_name.contains('.') {
        return quote_identifier(field_name);
    }
    let components = transform_dot_field_to_components(field_name);
    match components.split_last() {
        Some((last, init)) if !init.is_empty() => format!("{}->>{}", init.join("->"), last),
        _ => quote_identifier(field_name),
    }
}

/// JSON path expression returning the nested value as jsonb
pub fn transform_dot_field_to_json(field_name: &str) -> String {
    transform_dot_field_to_components(field_name).join("->")
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // quote_identifier Tests
    // =========================================================================

    #[test]
    fn test_quote_identifier_simple() {
        assert_eq!(quote_identifier("my_table"), "\"my_table\"");
        assert_eq!(quote_identifier("_User"), "\"_User\"");
    }

    #[test]
    fn test_quote_identifier_with_quotes() {
        assert_eq!(
            quote_identifier("table\"with\"quotes"),
            "\"table\"\"with\"\"quotes\""
        );
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("abc"), "'abc'");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    // =========================================================================
    // Class Name Tests
    // =========================================================================

    #[test]
    fn test_validate_class_name() {
        assert!(validate_class_name("GameScore").is_ok());
        assert!(validate_class_name("_User").is_ok());
        assert!(validate_class_name("_Join:friends:_User").is_ok());
        assert!(validate_class_name("1abc").is_err());
        assert!(validate_class_name("bad name").is_err());
        assert!(validate_class_name("x\";DROP").is_err());
    }

    // =========================================================================
    // Dot Field Tests
    // =========================================================================

    #[test]
    fn test_transform_plain_field() {
        assert_eq!(transform_dot_field("name"), "\"name\"");
    }

    #[test]
    fn test_transform_dot_field() {
        assert_eq!(transform_dot_field("a.b"), "\"a\"->>'b'");
        assert_eq!(transform_dot_field("a.b.c"), "\"a\"->'b'->>'c'");
    }

    #[test]
    fn test_transform_dot_field_with_index() {
        assert_eq!(transform_dot_field("a.0.c"), "\"a\"->0->>'c'");
    }

    #[test]
    fn test_transform_dot_field_escapes_keys() {
        assert_eq!(transform_dot_field("a.it's"), "\"a\"->>'it''s'");
    }

    #[test]
    fn test_transform_dot_field_to_json() {
        assert_eq!(transform_dot_field_to_json("a.b.c"), "\"a\"->'b'->'c'");
    }
}
