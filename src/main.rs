// A read-only TFTP server (RFC 1350) that serves one directory to one client at a time.
//
// Transfer begins with a read request naming a file under the served directory. The file
// goes out in blocks of 512 bytes, each of which must be acknowledged before the next one
// is sent; the first block shorter than 512 bytes ends the transfer. A reply that is not
// the expected acknowledgement makes the server send the same block again. There are no
// retransmission timers, no options and no uploads.
//
// Errors are signalled with a single error packet which is never acknowledged or
// retransmitted:
//
// 1    File not found
// 2    Access violation (uploads, paths outside the served directory)
// 4    Illegal TFTP op (anything but a read request as first contact)

use std::ffi::OsString;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;

pub mod processor;
pub mod sandbox;
pub mod srv_conn;
pub mod tftp;

use srv_conn::{Server, ServerConfig};

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "tftpd",
    about = "Read-only TFTP server",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Cli {
    /// UDP port to listen on
    port: u16,

    /// Directory to serve files from
    data_folder: PathBuf,

    /// Anything after the data folder is ignored.
    #[arg(hide = true, trailing_var_arg = true, allow_hyphen_values = true)]
    extra: Vec<OsString>,
}

fn print_usage() {
    println!("{}", Cli::command().render_usage());
}

/// Parses the command line. `None` means usage should be printed and nothing else done:
/// an argument is missing, or a flag such as `--help` was given.
fn parse_args<I, T>(args: I) -> Result<Option<Cli>, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(cli) => Ok(Some(cli)),
        Err(e) if matches!(e.kind(), ErrorKind::MissingRequiredArgument | ErrorKind::UnknownArgument) => Ok(None),
        Err(e) => Err(e),
    }
}

/// The OS error code behind a fatal error, so the exit status says what went wrong.
fn exit_code(e: &anyhow::Error) -> i32 {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<io::Error>())
        .and_then(io::Error::raw_os_error)
        .unwrap_or(1)
}

async fn run(cli: Cli) -> Result<()> {
    let config = ServerConfig::new(cli.port, cli.data_folder);
    let server = Server::bind(config)
        .await
        .with_context(|| format!("could not start on port {}", cli.port))?;

    log::info!(
        "Server started on {}:{} with data folder {}, listening for requests...",
        Ipv4Addr::UNSPECIFIED,
        server.local_addr()?.port(),
        server.root().display()
    );

    server.serve().await.context("server stopped")
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = match parse_args(std::env::args_os()) {
        Ok(Some(cli)) => cli,
        Ok(None) => {
            print_usage();
            return;
        }
        Err(e) => e.exit(),
    };
    if !cli.extra.is_empty() {
        log::debug!("Ignoring {} extra argument(s)", cli.extra.len());
    }

    if let Err(e) = run(cli).await {
        log::error!("{:#}", e);
        std::process::exit(exit_code(&e));
    }
}
