use std::io::IsTerminal;

use anyhow::Result;
use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON when stderr is not a terminal (in-cluster), text otherwise.
    #[default]
    Auto,
    Text,
    Json,
}

impl LogFormat {
    fn json(self) -> bool {
        match self {
            LogFormat::Json => true,
            LogFormat::Text => false,
            LogFormat::Auto => !std::io::stderr().is_terminal(),
        }
    }
}

/// `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let env = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let base = fmt::layer().with_target(false).with_writer(std::io::stderr);
    if format.json() {
        tracing_subscriber::registry().with(env).with(base.json()).try_init()?;
    } else {
        tracing_subscriber::registry().with(env).with(base.compact()).try_init()?;
    }
    Ok(())
}
