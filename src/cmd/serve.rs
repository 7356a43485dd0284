use crate::layer::Context;
use crate::nsrep::RttCache;
use crate::worker::Worker;
use clap::Args;
use recursor_server::network::{Network, Proto};
use std::rc::Rc;

/// Starts the resolver daemon, the core of the machine
#[derive(Args, Debug)]
pub struct Command;

impl Command {
    pub async fn run(&self, config: crate::config::Config) {
        tracing::info!("preparing resolver");
        let cache = config
            .cache
            .build()
            .expect("unable to open the record cache");

        let ctx = Rc::new(Context {
            cache: Some(Rc::new(cache)),
            rtt: RttCache::default(),
            roots: config.resolver.root_hints(),
            negative_ttl: config.resolver.negative_ttl,
        });
        let worker = Rc::new(Worker::new(ctx));

        let address = config.dns.address();
        let mut network = Network::new(worker);
        network
            .listen(
                &address.ip().to_string(),
                address.port(),
                Proto::UDP | Proto::TCP,
            )
            .expect("unable to bind listeners");

        tracing::info!("resolver running");
        // Listeners live on the local task set; keep the command alive.
        futures::future::pending::<()>().await;
    }
}
