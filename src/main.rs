use anyhow::Result;

use health_card_reader::cli::commands::run_cli;

fn main() -> Result<()> {
    run_cli()
}
