use anyhow::Result;

fn main() -> Result<()> {
    hmr_bench::cli::run()
}
