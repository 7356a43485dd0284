use clap::Parser;

fn main() -> std::io::Result<()> {
    recursor::init_logs();

    let args = recursor::cmd::Args::parse();

    // One cooperative loop: tasks overlap their I/O on a single thread,
    // so none of the shared state needs locking.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, args.run());

    Ok(())
}
