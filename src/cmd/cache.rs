use clap::{Args, Subcommand};

/// Inspect or maintain the persistent record cache
#[derive(Args, Debug)]
pub struct Command {
    #[command(subcommand)]
    inner: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print how many entries the cache holds
    Count,
    /// Drop every cached entry
    Clear,
}

impl Command {
    pub async fn run(&self, config: crate::config::Config) {
        let cache = config
            .cache
            .build()
            .expect("unable to open the record cache");
        match self.inner {
            Commands::Count => {
                let txn = cache.begin_read().expect("unable to read the cache");
                let count = txn.count().expect("unable to count entries");
                // The version marker is bookkeeping, not content.
                println!("{}", count.saturating_sub(1));
            }
            Commands::Clear => {
                let mut txn = cache.begin_write().expect("unable to write the cache");
                txn.clear().expect("unable to clear the cache");
                txn.commit().expect("unable to commit the clear");
                tracing::info!("cache cleared");
            }
        }
    }
}
