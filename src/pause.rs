use std::collections::HashSet;
use std::io::{self, BufRead, Write};

/// Checkpoint tags for the interactive single-step hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Layer {
    Ip,
    Tcp,
    Tls,
    Http2,
}

impl Layer {
    fn tag(self) -> &'static str {
        match self {
            Layer::Ip => "ip",
            Layer::Tcp => "tcp",
            Layer::Tls => "tls",
            Layer::Http2 => "http2",
        }
    }
}

/// Blocks on stdin at each enabled layer checkpoint so an operator can
/// watch one protocol step at a time. `Pause::none()` is the no-op used
/// by tests and by default.
#[derive(Debug, Default)]
pub struct Pause {
    layers: HashSet<Layer>,
}

impl Pause {
    pub fn new(layers: impl IntoIterator<Item = Layer>) -> Self {
        Pause {
            layers: layers.into_iter().collect(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn pause(&self, layer: Layer) {
        if !self.layers.contains(&layer) {
            return;
        }

        eprint!("[{}] paused, press enter to continue ", layer.tag());
        io::stderr().flush().ok();

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok();
    }
}
