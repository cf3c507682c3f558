// CyberNetCall node: console peer over a WebRTC data channel.

mod app;
mod config;
mod relay;
mod store;
mod webrtc;

use std::path::PathBuf;

use clap::Parser;
use cnc_core::ChunkEncoding;
use tracing_subscriber::EnvFilter;

/// CyberNetCall - serverless chat, posts, files and calls between two peers.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Verbosity level (-v, -vv, -vvv). RUST_LOG overrides it.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (default: ~/.config/cybernetcall/config.toml, then /etc/cybernetcall/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Websocket relay for offer/answer envelopes.
    #[arg(long)]
    relay: Option<String>,

    /// Directory for received files.
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// File chunk size in bytes. Both peers must use the same value.
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Send chunks as binary frames instead of JSON text.
    #[arg(long)]
    binary_chunks: bool,

    /// Keep posts in memory only.
    #[arg(long)]
    no_persist: bool,
}

impl Args {
    fn apply(&self, cfg: &mut config::Config) {
        if let Some(url) = &self.relay {
            cfg.relay_url = Some(url.clone());
        }
        if let Some(dir) = &self.download_dir {
            cfg.download_dir = dir.clone();
        }
        if let Some(n) = self.chunk_size.filter(|n| *n > 0) {
            cfg.chunk_size = n;
        }
        if self.binary_chunks {
            cfg.chunk_encoding = ChunkEncoding::Binary;
        }
        if self.no_persist {
            cfg.posts_file = None;
        }
    }
}

fn init_tracing(verbose: u8) {
    // Late STUN responses make webrtc_ice warn about unknown transactions; keep those quiet.
    let level = match verbose {
        0 => "warn,cnc_node=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // stdout belongs to the console; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut cfg = match &args.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };
    args.apply(&mut cfg);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(app::run(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "cnc-node",
            "-vv",
            "--relay",
            "ws://relay.local:8765",
            "--chunk-size",
            "8192",
            "--binary-chunks",
            "--no-persist",
        ]);
        assert_eq!(args.verbose, 2);
        let mut cfg = config::Config::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.relay_url.as_deref(), Some("ws://relay.local:8765"));
        assert_eq!(cfg.chunk_size, 8192);
        assert_eq!(cfg.chunk_encoding, ChunkEncoding::Binary);
        assert!(cfg.posts_file.is_none());
    }
}
