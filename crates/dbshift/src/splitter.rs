//! Multi-statement SQL splitting.
//!
//! Splits a script into engine-safe statements at top-level semicolons while
//! respecting single-quoted strings, double-quoted identifiers, PostgreSQL
//! dollar-quoted strings, `--` line comments and `/* */` block comments
//! (nestable only in PostgreSQL). Statement text is preserved verbatim apart
//! from leading-whitespace trimming; whitespace-only statements are dropped.

use crate::driver::EngineType;

/// Statement splitter configured for one engine dialect.
#[derive(Debug, Clone, Copy)]
pub struct StatementSplitter {
    /// `$tag$ ... $tag$` string literals.
    dollar_quoting: bool,
    /// `/* /* */ */` nesting.
    nested_block_comments: bool,
}

impl StatementSplitter {
    pub fn new(engine: EngineType) -> Self {
        match engine {
            EngineType::Postgres => Self {
                dollar_quoting: true,
                nested_block_comments: true,
            },
            EngineType::Mysql => Self {
                dollar_quoting: false,
                nested_block_comments: false,
            },
        }
    }

    /// Split `script` into statements.
    pub fn split(&self, script: &str) -> Vec<String> {
        let chars: Vec<char> = script.chars().collect();
        let mut statements = Vec::new();
        let mut current = String::new();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();

            match c {
                '\'' => {
                    i = self.consume_quoted(&chars, i, '\'', &mut current);
                    continue;
                }
                '"' => {
                    i = self.consume_quoted(&chars, i, '"', &mut current);
                    continue;
                }
                '$' if self.dollar_quoting => {
                    if let Some(end) = self.consume_dollar_quote(&chars, i, &mut current) {
                        i = end;
                        continue;
                    }
                }
                '-' if next == Some('-') => {
                    // Line comment runs to end of line, newline kept.
                    while i < chars.len() && chars[i] != '\n' {
                        current.push(chars[i]);
                        i += 1;
                    }
                    continue;
                }
                '/' if next == Some('*') => {
                    i = self.consume_block_comment(&chars, i, &mut current);
                    continue;
                }
                ';' => {
                    push_statement(&mut statements, &mut current);
                    i += 1;
                    continue;
                }
                _ => {}
            }

            current.push(c);
            i += 1;
        }

        push_statement(&mut statements, &mut current);
        statements
    }

    /// Consume a quoted region starting at `start` (which holds `quote`).
    ///
    /// A doubled quote is an escape in both dialects.
    fn consume_quoted(&self, chars: &[char], start: usize, quote: char, out: &mut String) -> usize {
        let mut i = start;
        out.push(chars[i]);
        i += 1;
        while i < chars.len() {
            out.push(chars[i]);
            if chars[i] == quote {
                if chars.get(i + 1) == Some(&quote) {
                    out.push(quote);
                    i += 2;
                    continue;
                }
                return i + 1;
            }
            i += 1;
        }
        i
    }

    /// Try to consume a `$tag$ ... $tag$` literal. Returns the index past the
    /// closing tag, or None when `start` is not a dollar-quote opener.
    fn consume_dollar_quote(&self, chars: &[char], start: usize, out: &mut String) -> Option<usize> {
        let mut j = start + 1;
        while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
            j += 1;
        }
        if chars.get(j) != Some(&'$') {
            return None;
        }
        let tag: String = chars[start..=j].iter().collect();

        out.push_str(&tag);
        let mut i = j + 1;
        let tag_chars: Vec<char> = tag.chars().collect();
        while i < chars.len() {
            if chars[i] == '$' && chars[i..].starts_with(&tag_chars[..]) {
                out.push_str(&tag);
                return Some(i + tag_chars.len());
            }
            out.push(chars[i]);
            i += 1;
        }
        Some(i)
    }

    /// Consume a block comment starting at `start` (which holds `/`).
    fn consume_block_comment(&self, chars: &[char], start: usize, out: &mut String) -> usize {
        let mut i = start;
        let mut depth = 0usize;
        while i < chars.len() {
            if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                if depth == 0 || self.nested_block_comments {
                    depth += 1;
                }
                out.push('/');
                out.push('*');
                i += 2;
                continue;
            }
            if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                out.push('*');
                out.push('/');
                i += 2;
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i;
                }
                continue;
            }
            out.push(chars[i]);
            i += 1;
        }
        i
    }
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let stmt = current.trim_start_matches([' ', '\t', '\n', '\r']);
    if !stmt.trim().is_empty() {
        statements.push(stmt.to_string());
    }
    current.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg() -> StatementSplitter {
        StatementSplitter::new(EngineType::Postgres)
    }

    fn mysql() -> StatementSplitter {
        StatementSplitter::new(EngineType::Mysql)
    }

    #[test]
    fn splits_on_top_level_semicolons() {
        let stmts = pg().split("CREATE TABLE t(id INT); SELECT 1/0;");
        assert_eq!(stmts, vec!["CREATE TABLE t(id INT)", "SELECT 1/0"]);
    }

    #[test]
    fn semicolon_inside_single_quotes_is_literal() {
        let stmts = pg().split("INSERT INTO t VALUES ('a;b'); SELECT 1;");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], "INSERT INTO t VALUES ('a;b')");
    }

    #[test]
    fn escaped_quote_does_not_terminate_string() {
        let stmts = pg().split("INSERT INTO t VALUES ('it''s; fine');");
        assert_eq!(stmts, vec!["INSERT INTO t VALUES ('it''s; fine')"]);
    }

    #[test]
    fn double_quoted_identifier_may_contain_semicolon() {
        let stmts = pg().split(r#"CREATE TABLE "weird;name" (id INT);"#);
        assert_eq!(stmts, vec![r#"CREATE TABLE "weird;name" (id INT)"#]);
    }

    #[test]
    fn dollar_quoted_body_is_one_statement() {
        let script = "CREATE FUNCTION f() RETURNS void AS $fn$ BEGIN; SELECT 1; END $fn$ LANGUAGE plpgsql; SELECT 2;";
        let stmts = pg().split(script);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("$fn$ BEGIN; SELECT 1; END $fn$"));
    }

    #[test]
    fn dollar_quoting_disabled_for_mysql() {
        let stmts = mysql().split("SELECT '$x$'; SELECT 2;");
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn line_comment_hides_semicolon() {
        let stmts = pg().split("SELECT 1 -- trailing; note\n+ 2;");
        assert_eq!(stmts, vec!["SELECT 1 -- trailing; note\n+ 2"]);
    }

    #[test]
    fn block_comment_hides_semicolon_and_nests_in_postgres() {
        let stmts = pg().split("SELECT /* outer /* inner; */ still; */ 1;");
        assert_eq!(stmts, vec!["SELECT /* outer /* inner; */ still; */ 1"]);
    }

    #[test]
    fn mysql_block_comments_do_not_nest() {
        let stmts = mysql().split("SELECT /* a /* b */ 1; SELECT 2;");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1], "SELECT 2");
    }

    #[test]
    fn empty_statements_are_dropped() {
        let stmts = pg().split(";;  ;\nSELECT 1;\n;");
        assert_eq!(stmts, vec!["SELECT 1"]);
    }

    #[test]
    fn final_statement_without_semicolon_is_kept() {
        let stmts = pg().split("SELECT 1;\nSELECT 2");
        assert_eq!(stmts, vec!["SELECT 1", "SELECT 2"]);
    }
}
