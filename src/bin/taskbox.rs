use anyhow::Result;

fn main() -> Result<()> {
    taskbox::cli::run()
}
