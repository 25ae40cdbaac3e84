//! Schema export via the bundled `pg_dump` binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::ConnectionConfig;
use crate::error::{DriverError, Result};

/// Line filter applied to the raw `pg_dump` stream.
///
/// Drops `SET SESSION AUTHORIZATION` lines, comment lines together with the
/// single blank line that closes a comment block, and collapses runs of blank
/// lines to at most one.
#[derive(Debug, Default)]
pub(super) struct DumpLineFilter {
    previous_line_comment: bool,
    previous_line_empty: bool,
}

impl DumpLineFilter {
    /// Whether `line` should be kept in the output.
    pub(super) fn keep(&mut self, line: &str) -> bool {
        if line.starts_with("SET SESSION AUTHORIZATION ") {
            return false;
        }
        if line.starts_with("--") {
            self.previous_line_comment = true;
            return false;
        }
        if self.previous_line_comment {
            self.previous_line_comment = false;
            if line.is_empty() {
                return false;
            }
        }
        if line.is_empty() {
            if self.previous_line_empty {
                return false;
            }
            self.previous_line_empty = true;
        } else {
            self.previous_line_empty = false;
        }
        true
    }
}

/// Location of the bundled `pg_dump`.
pub(super) fn pg_dump_path(pg_bin_dir: &Path) -> PathBuf {
    pg_bin_dir.join("bin").join("pg_dump")
}

/// Dump one database through `pg_dump`, filtering the stream into `out`.
///
/// The password travels via `PGPASSWORD` in the subprocess environment, never
/// on the command line. Cancellation kills the child.
pub(super) async fn dump_one_database(
    pg_bin_dir: &Path,
    config: &ConnectionConfig,
    database: &str,
    out: &mut (dyn AsyncWrite + Send + Unpin),
    schema_only: bool,
    include_connect_directive: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut args: Vec<String> = vec![
        format!("--username={}", config.username),
        format!("--host={}", config.host),
        format!("--port={}", config.port),
    ];
    if config.password.is_empty() {
        args.push("--no-password".to_string());
    }
    if schema_only {
        args.push("--schema-only".to_string());
    }
    args.push("--inserts".to_string());
    args.push("--use-set-session-authorization".to_string());
    args.push(database.to_string());

    let mut cmd = Command::new(pg_dump_path(pg_bin_dir));
    cmd.args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if !config.password.is_empty() {
        cmd.env("PGPASSWORD", &config.password);
    }

    let mut child = cmd.spawn().map_err(|e| {
        DriverError::Internal(format!(
            "failed to spawn pg_dump from {:?}: {e}",
            pg_dump_path(pg_bin_dir)
        ))
    })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| DriverError::Internal("pg_dump stdout not captured".to_string()))?;

    if include_connect_directive {
        out.write_all(format!("\\connect \"{database}\";\n").as_bytes())
            .await?;
    }

    let mut lines = BufReader::new(stdout).lines();
    let mut filter = DumpLineFilter::default();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill cancelled pg_dump");
                }
                return Err(DriverError::Cancelled);
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if filter.keep(&line) {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(DriverError::Internal(format!(
            "pg_dump of {database:?} exited with {status}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_script(input: &str) -> String {
        let mut filter = DumpLineFilter::default();
        let mut out = String::new();
        for line in input.lines() {
            if filter.keep(line) {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    #[test]
    fn drops_session_authorization_lines() {
        let out = filter_script("SET SESSION AUTHORIZATION 'owner';\nCREATE TABLE t (id int);\n");
        assert_eq!(out, "CREATE TABLE t (id int);\n");
    }

    #[test]
    fn drops_comment_blocks_with_their_trailing_blank_line() {
        let input = "--\n-- Name: t; Type: TABLE\n--\n\nCREATE TABLE t (id int);\n";
        assert_eq!(filter_script(input), "CREATE TABLE t (id int);\n");
    }

    #[test]
    fn collapses_blank_runs_to_one() {
        let input = "CREATE TABLE a (id int);\n\n\n\nCREATE TABLE b (id int);\n";
        assert_eq!(
            filter_script(input),
            "CREATE TABLE a (id int);\n\nCREATE TABLE b (id int);\n"
        );
    }

    #[test]
    fn keeps_blank_line_after_statement_before_comment() {
        let input = "CREATE TABLE a (id int);\n\n--\n-- comment\n--\n\nCREATE TABLE b (id int);\n";
        assert_eq!(
            filter_script(input),
            "CREATE TABLE a (id int);\n\nCREATE TABLE b (id int);\n"
        );
    }

    #[test]
    fn pg_dump_path_is_under_bin() {
        let path = pg_dump_path(Path::new("/opt/pg"));
        assert_eq!(path, PathBuf::from("/opt/pg/bin/pg_dump"));
    }
}
