//! `dspy`: a headless framebuffer client. Connects to the renderer's
//! display port, receives one frame and writes it as TIFF on Close.

use anyhow::{bail, Context};
use dspy::{ClientRun, DisplayClient, DD_PORT_ENV};
use tracing::info;

struct Options {
    host: String,
    port: Option<u16>,
}

fn parse_args() -> anyhow::Result<Options> {
    let mut opts = Options {
        host: "127.0.0.1".to_string(),
        port: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-i" => {
                opts.host = args.next().context("-i needs a host argument")?;
            }
            "-p" => {
                let p = args.next().context("-p needs a port argument")?;
                opts.port = Some(p.parse().context("invalid port")?);
            }
            other => bail!("unknown argument `{other}` (expected -i host / -p port)"),
        }
    }
    Ok(opts)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opts = parse_args()?;
    let port = match opts.port {
        Some(p) => p,
        None => std::env::var(DD_PORT_ENV)
            .with_context(|| format!("no -p and {DD_PORT_ENV} unset"))?
            .parse()
            .context("invalid port in environment")?,
    };

    let mut client = DisplayClient::connect(&opts.host, port)
        .with_context(|| format!("connecting to {}:{port}", opts.host))?;
    let ClientRun { saved, abandoned } = client.run().context("display protocol failed")?;
    if abandoned {
        info!("frame abandoned by renderer");
    }
    if let Some(path) = saved {
        info!(path = %path.display(), "frame written");
    }
    Ok(())
}
