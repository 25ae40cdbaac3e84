//! PostgreSQL identifier quoting.

use std::sync::LazyLock;

use regex::Regex;

/// Reserved words that always need quoting, per the PostgreSQL keyword table.
static RESERVED: &[&str] = &[
    "ALL",
    "ANALYSE",
    "ANALYZE",
    "AND",
    "ANY",
    "ARRAY",
    "AS",
    "ASC",
    "ASYMMETRIC",
    "AUTHORIZATION",
    "BINARY",
    "BOTH",
    "CASE",
    "CAST",
    "CHECK",
    "COLLATE",
    "COLLATION",
    "COLUMN",
    "CONCURRENTLY",
    "CONSTRAINT",
    "CREATE",
    "CROSS",
    "CURRENT_CATALOG",
    "CURRENT_DATE",
    "CURRENT_ROLE",
    "CURRENT_SCHEMA",
    "CURRENT_TIME",
    "CURRENT_TIMESTAMP",
    "CURRENT_USER",
    "DEFAULT",
    "DEFERRABLE",
    "DESC",
    "DISTINCT",
    "DO",
    "ELSE",
    "END",
    "EXCEPT",
    "FALSE",
    "FETCH",
    "FOR",
    "FOREIGN",
    "FREEZE",
    "FROM",
    "FULL",
    "GRANT",
    "GROUP",
    "HAVING",
    "ILIKE",
    "IN",
    "INITIALLY",
    "INNER",
    "INTERSECT",
    "INTO",
    "IS",
    "ISNULL",
    "JOIN",
    "LATERAL",
    "LEADING",
    "LEFT",
    "LIKE",
    "LIMIT",
    "LOCALTIME",
    "LOCALTIMESTAMP",
    "NATURAL",
    "NOT",
    "NOTNULL",
    "NULL",
    "OFFSET",
    "ON",
    "ONLY",
    "OR",
    "ORDER",
    "OUTER",
    "OVERLAPS",
    "PLACING",
    "PRIMARY",
    "REFERENCES",
    "RETURNING",
    "RIGHT",
    "SELECT",
    "SESSION_USER",
    "SIMILAR",
    "SOME",
    "SYMMETRIC",
    "TABLE",
    "TABLESAMPLE",
    "THEN",
    "TO",
    "TRAILING",
    "TRUE",
    "UNION",
    "UNIQUE",
    "USER",
    "USING",
    "VARIADIC",
    "VERBOSE",
    "WHEN",
    "WHERE",
    "WINDOW",
    "WITH",
];

static IDENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").unwrap());

fn is_reserved(s: &str) -> bool {
    let upper = s.to_uppercase();
    RESERVED.binary_search(&upper.as_str()).is_ok()
}

/// Whether `s` is already a single validly quoted identifier.
fn is_quoted(s: &str) -> bool {
    if s.len() < 2 || !s.starts_with('"') || !s.ends_with('"') {
        return false;
    }
    // Interior quotes must come in doubled pairs.
    let inner = &s[1..s.len() - 1];
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' && chars.next() != Some('"') {
            return false;
        }
    }
    true
}

/// Quote an identifier exactly when needed.
///
/// Quoting applies when the identifier is a reserved keyword
/// (case-insensitive) or does not match `^[A-Za-z_][A-Za-z0-9_$]*$`;
/// embedded quotes are doubled. Already-quoted inputs pass through unchanged.
pub fn quote_identifier(s: &str) -> String {
    if is_quoted(s) {
        return s.to_string();
    }
    if is_reserved(s) || !IDENT.is_match(s) {
        return format!("\"{}\"", s.replace('"', "\"\""));
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_list_is_sorted_for_binary_search() {
        let mut sorted = RESERVED.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, RESERVED);
    }

    #[test]
    fn reserved_word_is_quoted_case_insensitively() {
        assert_eq!(quote_identifier("Select"), "\"Select\"");
        assert_eq!(quote_identifier("TABLE"), "\"TABLE\"");
    }

    #[test]
    fn plain_identifier_passes_through() {
        assert_eq!(quote_identifier("plain"), "plain");
        assert_eq!(quote_identifier("_tbl$2"), "_tbl$2");
    }

    #[test]
    fn special_characters_force_quoting_and_double_quotes() {
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_identifier("has space"), "\"has space\"");
        assert_eq!(quote_identifier("1starts_with_digit"), "\"1starts_with_digit\"");
    }

    #[test]
    fn already_quoted_input_is_idempotent() {
        assert_eq!(quote_identifier("\"Select\""), "\"Select\"");
        assert_eq!(quote_identifier("\"a\"\"b\""), "\"a\"\"b\"");
        // A lone interior quote is not validly quoted, so it gets requoted.
        assert_eq!(quote_identifier("\"a\"b\""), "\"\"\"a\"\"b\"\"\"");
    }
}
