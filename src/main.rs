use anyhow::Result;

fn main() -> Result<()> {
    modvault::cli::run()
}
