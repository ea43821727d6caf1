use std::process;
use std::sync::Arc;

use clap::Parser;
use log::{error, LevelFilter};

use clearstack::config::{Config, Mode};
use clearstack::err::Error;
use clearstack::keys::Identity;
use clearstack::pause::Pause;
use clearstack::{stream, NetStack};

fn main() {
    let cfg = Config::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cfg.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();

    if let Err(e) = run(cfg) {
        error!("{}", e);
        process::exit(1);
    }
}

fn run(cfg: Config) -> Result<(), Error> {
    let identity = Arc::new(Identity::load(&cfg.cert, &cfg.key)?);
    let pause = Arc::new(Pause::new(cfg.pause.iter().copied()));

    match cfg.mode {
        Mode::Tun => NetStack::new(&cfg, identity, pause)?.join(),
        Mode::Tcp => stream::serve(cfg.port, identity, pause)?,
    }

    Ok(())
}
