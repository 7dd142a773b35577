//! CLI integration tests.
//!
//! Tests cover:
//! - Argument parsing into commands
//! - `validate` and `eval` against a snapshot file
//! - Account and order management against an on-disk SQLite store
//! - Exit codes for config, parse and store failures

use clap::Parser;
use ruletrader::cli::{self, Cli};
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;

fn write_file(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path.display().to_string()
}

const SNAPSHOT: &str = "\
source,entity,field,kind,value
market,BTC,last_px,number,45500
market,SOL,last_px,number,205.8
candles,BTC,close,series,100;150;200;250;300
";

/// A config whose store and snapshot live in `dir`.
fn write_config(dir: &Path) -> String {
    let snapshot = write_file(dir, "snapshot.csv", SNAPSHOT);
    let ini = format!(
        "[engine]\n\
         tick_interval_secs = 1\n\
         \n\
         [sqlite]\n\
         path = {}\n\
         \n\
         [data]\n\
         snapshot_path = {snapshot}\n",
        dir.join("orders.db").display()
    );
    write_file(dir, "engine.ini", &ini)
}

fn run(args: &[&str]) -> ExitCode {
    let mut argv = vec!["ruletrader"];
    argv.extend_from_slice(args);
    cli::run(Cli::try_parse_from(argv).unwrap())
}

// ExitCode doesn't implement PartialEq, compare the debug rendering.
fn assert_exit(code: ExitCode, expected: u8) {
    assert_eq!(
        format!("{code:?}"),
        format!("{:?}", ExitCode::from(expected)),
        "expected exit code {expected}"
    );
}

mod expressions {
    use super::*;

    #[test]
    fn validate_accepts_known_names() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        let code = run(&[
            "validate",
            "--expr",
            "avg(candles.BTC.close, 3) < market.BTC.last_px",
            "--config",
            &config,
        ]);
        assert_exit(code, 0);
    }

    #[test]
    fn validate_without_config_knows_default_sources() {
        assert_exit(run(&["validate", "--expr", "news.coindesk.title has \"ETF\""]), 0);
    }

    #[test]
    fn syntax_error_exits_with_parse_code() {
        assert_exit(run(&["validate", "--expr", "market.BTC.last_px >"]), 4);
    }

    #[test]
    fn unknown_source_exits_with_parse_code() {
        assert_exit(run(&["validate", "--expr", "binance.BTC.last_px > 1"]), 4);
    }

    #[test]
    fn eval_reads_snapshot_values() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        let code = run(&[
            "eval",
            "--expr",
            "market.SOL.last_px > 200",
            "--config",
            &config,
        ]);
        assert_exit(code, 0);
    }

    #[test]
    fn eval_missing_data_exits_with_eval_code() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        let code = run(&["eval", "--expr", "market.DOGE.last_px > 1", "-c", &config]);
        assert_exit(code, 5);
    }
}

mod config_errors {
    use super::*;

    #[test]
    fn missing_config_file() {
        let code = run(&["list-orders", "--config", "/nonexistent/path/engine.ini"]);
        assert_exit(code, 2);
    }

    #[test]
    fn missing_store_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_file(dir.path(), "engine.ini", "[engine]\ntick_interval_secs = 5\n");
        assert_exit(run(&["list-orders", "--config", &config]), 2);
    }

    #[test]
    fn bad_snapshot_row() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = write_file(
            dir.path(),
            "snapshot.csv",
            "source,entity,field,kind,value\nmarket,BTC,last_px,number,lots\n",
        );
        let config = write_file(
            dir.path(),
            "engine.ini",
            &format!("[data]\nsnapshot_path = {snapshot}\n"),
        );
        assert_exit(run(&["validate", "--expr", "market.BTC.last_px > 1", "-c", &config]), 5);
    }
}

#[cfg(feature = "sqlite")]
mod orders {
    use super::*;

    #[test]
    fn order_lifecycle_through_the_cli() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());

        assert_exit(
            run(&["add-account", "-c", &config, "--id", "1", "--name", "main"]),
            0,
        );
        assert_exit(
            run(&[
                "add-order",
                "-c",
                &config,
                "--account",
                "1",
                "--symbol",
                "BTC",
                "--side",
                "buy",
                "--size",
                "0.1",
                "--when",
                "market.BTC.last_px > 50000",
            ]),
            0,
        );
        assert_exit(run(&["list-orders", "-c", &config]), 0);
        assert_exit(run(&["list-orders", "-c", &config, "--waiting"]), 0);
        assert_exit(run(&["cancel-order", "-c", &config, "--id", "1"]), 0);

        // Cancelled is terminal.
        assert_exit(run(&["cancel-order", "-c", &config, "--id", "1"]), 3);
    }

    #[test]
    fn order_for_unknown_account_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        let code = run(&[
            "add-order", "-c", &config, "--account", "7", "--symbol", "BTC", "--side", "sell",
            "--size", "1",
        ]);
        assert_exit(code, 3);
    }

    #[test]
    fn order_with_invalid_condition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        assert_exit(
            run(&["add-account", "-c", &config, "--id", "1", "--name", "main"]),
            0,
        );
        let code = run(&[
            "add-order", "-c", &config, "--account", "1", "--symbol", "BTC", "--side", "buy",
            "--size", "1", "--when", "market.BTC.last_px >> 1",
        ]);
        assert_exit(code, 4);
    }

    #[test]
    fn cancel_unknown_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        assert_exit(run(&["cancel-order", "-c", &config, "--id", "42"]), 3);
    }
}
