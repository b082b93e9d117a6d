//! Validates: `fab pnl` reads a fresh working directory's (missing)
//! `pnl.json` as an empty ledger and prints zeroed totals rather than
//! erroring — mirroring `PnlLedger::load`'s corruption/absence tolerance.
//!
//! GREEN when `fab pnl` exits successfully and prints all four zeroed
//! total lines.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn pnl_command_prints_zero_totals_in_a_fresh_directory() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let mut cmd = Command::cargo_bin("fab")?;
    cmd.current_dir(dir.path()).arg("pnl");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("realized_pnl=0.00"))
        .stdout(predicate::str::contains("total_funding=0.00"))
        .stdout(predicate::str::contains("total_fees=0.00"))
        .stdout(predicate::str::contains("net_pnl=0.00"));

    Ok(())
}
