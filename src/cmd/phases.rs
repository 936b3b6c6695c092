//! `sparlo phases` — print the phase catalog for each run mode.

use anyhow::Result;
use console::style;

use sparlo::models::RunMode;
use sparlo::phases::catalog;

pub fn cmd_phases() -> Result<()> {
    for mode in [RunMode::Standard, RunMode::Discovery, RunMode::DueDiligence] {
        println!("{}", style(mode.to_string()).bold().cyan());
        for spec in catalog(mode) {
            if spec.depends_on.is_empty() {
                println!("  {}", style(spec.name).bold());
            } else {
                println!(
                    "  {} {}",
                    style(spec.name).bold(),
                    style(format!("(after {})", spec.depends_on.join(", "))).dim()
                );
            }
        }
        println!();
    }
    Ok(())
}
