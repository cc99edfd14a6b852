//! Regex pattern translation
//!
//! Query regexes may quote literal runs with `\Q...\E`. POSIX regexes have no
//! such syntax, so quoted runs are expanded into escaped characters. The result
//! is inlined as a SQL string literal, which is why single quotes are doubled.

use std::sync::LazyLock;

use regex::Regex;

static STARTS_WITH_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\^\\Q.*\\E").expect("valid starts-with regex"));

static EXTENDED_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)([^\\])#.*\n").expect("valid comment regex"));

static EXTENDED_LEADING_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#.*\n").expect("valid comment regex"));

static EXTENDED_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^\\])\s+").expect("valid whitespace regex"));

/// Translate a query regex into a POSIX pattern safe to inline in a literal
pub fn process_regex_pattern(pattern: &str) -> String {
    if let Some(rest) = pattern.strip_prefix('^') {
        format!("^{}", literalize_regex_part(rest))
    } else if let Some(rest) = pattern.strip_suffix('$') {
        format!("{}$", literalize_regex_part(rest))
    } else {
        literalize_regex_part(pattern)
    }
}

fn literalize_regex_part(part: &str) -> String {
    if let Some(start) = part.find("\\Q") {
        let prefix = &part[..start];
        let quoted = &part[start + 2..];
        let quoted = quoted.strip_suffix("\\E").unwrap_or(quoted);
        return format!(
            "{}{}",
            literalize_regex_part(prefix),
            create_literal_regex(quoted)
        );
    }

    // Unmatched markers carry no meaning outside a quoted run
    part.replace("\\E", "").replace('\'', "''")
}

/// Escape every character that is not a digit, space or letter
fn create_literal_regex(remaining: &str) -> String {
    let mut out = String::with_capacity(remaining.len() * 2);
    for c in remaining.chars() {
        if c.is_ascii_digit() || c == ' ' || c.is_alphabetic() {
            out.push(c);
        } else if c == '\'' {
            out.push_str("''");
        } else {
            out.push('\\');
            out.push(c);
        }
    }
    out
}

/// Whether a regex is an anchored literal prefix (`^\Q...\E`)
pub fn is_starts_with_regex(pattern: &str) -> bool {
    pattern.starts_with('^') && STARTS_WITH_LITERAL.is_match(pattern)
}

/// Strip comments and whitespace from an extended (`x` option) regex
pub fn remove_white_space(pattern: &str) -> String {
    let mut pattern = pattern.to_string();
    if !pattern.ends_with('\n') {
        pattern.push('\n');
    }
    let pattern = EXTENDED_COMMENT.replace_all(&pattern, "$1");
    let pattern = EXTENDED_LEADING_COMMENT.replace_all(&pattern, "");
    let pattern = EXTENDED_SPACE.replace_all(&pattern, "$1");
    pattern.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Literal Quoting Tests
    // =========================================================================

    #[test]
    fn test_anchored_literal_prefix() {
        let pattern = process_regex_pattern("^\\Qa.b\\E");
        assert_eq!(pattern, "^a\\.b");

        let re = Regex::new(&pattern).unwrap();
        assert!(re.is_match("a.b..."));
        assert!(!re.is_match("xa.b"));
        assert!(!re.is_match("axb"));
    }

    #[test]
    fn test_unterminated_quote() {
        assert_eq!(process_regex_pattern("\\Q1+1"), "1\\+1");
    }

    #[test]
    fn test_prefix_before_quote_is_kept() {
        assert_eq!(process_regex_pattern("ab*\\Q(x)\\E"), "ab*\\(x\\)");
    }

    #[test]
    fn test_trailing_anchor() {
        assert_eq!(process_regex_pattern("\\Q.com\\E$"), "\\.com$");
    }

    #[test]
    fn test_plain_regex_passes_through() {
        assert_eq!(process_regex_pattern("^ab+c"), "^ab+c");
        assert_eq!(process_regex_pattern("foo"), "foo");
    }

    #[test]
    fn test_single_quotes_are_doubled() {
        assert_eq!(process_regex_pattern("it's"), "it''s");
        assert_eq!(process_regex_pattern("^\\Qit's\\E"), "^it''s");
    }

    #[test]
    fn test_unicode_letters_not_escaped() {
        assert_eq!(process_regex_pattern("^\\Qcafé ü\\E"), "^café ü");
    }

    // =========================================================================
    // Classification Tests
    // =========================================================================

    #[test]
    fn test_is_starts_with_regex() {
        assert!(is_starts_with_regex("^\\Qabc\\E"));
        assert!(!is_starts_with_regex("\\Qabc\\E"));
        assert!(!is_starts_with_regex("^abc"));
    }

    #[test]
    fn test_remove_white_space() {
        assert_eq!(remove_white_space("a b  # comment\nc"), "abc");
        assert_eq!(remove_white_space("a\\ b"), "a\\ b");
    }
}
