use anyhow::Result;

fn main() -> Result<()> {
    renderbox::cli::run()
}
