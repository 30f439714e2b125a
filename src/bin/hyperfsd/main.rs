use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use hyperfs::{
    devmux, Bridge, BridgeConfig, DirPassthrough, GuestPort, HyperFs, HyperPathSet,
    HypercallPort, MuxConfig, Session,
};

#[derive(Parser, Debug)]
#[command(name = "hyperfsd", about = "Guest daemon bridging virtual files to the hypervisor")]
struct Args {
    /// Directory tree backing every non-virtual path.
    passthrough_root: String,

    /// Where the merged filesystem is mounted.
    mountpoint: String,

    /// Colon-separated absolute virtual paths. Discovered from the host
    /// when omitted.
    #[arg(long)]
    hyperfile_paths: Option<String>,

    /// Serve virtual files as plain files through the mount instead of
    /// dedicated character devices.
    #[arg(long)]
    no_multiplex: bool,

    /// Give up on a host-busy operation after this many retries instead of
    /// retrying forever.
    #[arg(long)]
    max_retries: Option<u64>,

    /// Milliseconds to wait for each device node to appear.
    #[arg(long)]
    dev_ready_timeout_ms: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let port: Arc<dyn HypercallPort> = Arc::new(GuestPort);
    let set = match &args.hyperfile_paths {
        Some(list) => HyperPathSet::from_list(list).context("parsing --hyperfile-paths")?,
        None => HyperPathSet::discover(&*port).context("discovering hyperfile paths")?,
    };
    info!(count = set.len(), "hyperfile paths loaded");

    let bridge = Arc::new(Bridge::new(
        port,
        BridgeConfig {
            max_retries: args.max_retries,
        },
    ));
    let pass = Arc::new(
        DirPassthrough::new(&args.passthrough_root)
            .with_context(|| format!("passthrough root {}", args.passthrough_root))?,
    );

    let devices = if args.no_multiplex || set.is_empty() {
        None
    } else {
        let config = MuxConfig {
            ready_timeout: args.dev_ready_timeout_ms.map(Duration::from_millis),
        };
        Some(
            devmux::spawn_devices(&set, bridge.clone(), &config)
                .context("starting device multiplexer")?,
        )
    };

    let fs = HyperFs::new(set, bridge, devices, pass);
    let mut session = Session::mount(fs, &args.mountpoint).context("mounting")?;
    session.run().context("serving requests")?;
    Ok(())
}
