use anyhow::Result;

mod cli;

fn main() -> Result<()> {
    let init = cli::load_pipeline()?;
    stagehand_core::orchestrator::run(init)?;
    Ok(())
}
