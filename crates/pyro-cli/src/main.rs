//! # Pyro CLI Entry Point
//!
//! Main binary of the Pyro remote object engine: serves the test echo
//! object and makes one-off calls against any daemon.
//!
//! ## Usage
//!
//! ```bash
//! # Serve the echo object (prints its URI on stdout)
//! pyro echo-server -b 127.0.0.1:9999
//!
//! # Serve it on the multiplexed server, over a Unix socket
//! pyro echo-server --multiplexed --unix /tmp/pyro.sock
//!
//! # Check that an object is reachable
//! pyro ping PYRO:test.echoserver@127.0.0.1:9999
//!
//! # Call a method (outputs raw JSON, one line per streamed item)
//! pyro call PYRO:test.echoserver@127.0.0.1:9999 echo -a '["hello"]'
//! ```
//!
//! Daemon and proxy settings come from `PYRO_*` environment variables.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use argh::FromArgs;
use pyro_cli::echo::{EchoServer, ECHO_NAME};
use pyro_client::{CallOutcome, Proxy};
use pyro_common::{Config, Location, PyroUri, ServerType};
use pyro_server::{Daemon, RegisterOptions, Server};

#[derive(FromArgs)]
/// Pyro - remote objects over TCP and Unix sockets
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    EchoServer(EchoServerArgs),
    Ping(PingArgs),
    Call(CallArgs),
}

/// Arguments for serving the echo object.
///
/// # Example
///
/// ```bash
/// pyro echo-server -b 0.0.0.0:9999 --verbose
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "echo-server")]
/// serve the test echo object
struct EchoServerArgs {
    /// address to bind to as host:port
    ///
    /// Port 0 picks a free port; the URI printed at startup has the real one.
    #[argh(option, short = 'b', default = "\"localhost:0\".into()")]
    bind: String,

    /// path of a Unix domain socket to listen on instead of TCP
    #[argh(option, long = "unix")]
    unix: Option<String>,

    /// use the multiplexed server instead of the thread pool
    #[argh(switch, long = "multiplexed")]
    multiplexed: bool,

    /// log every echoed message
    #[argh(switch, short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "ping")]
/// check that a remote object is reachable
struct PingArgs {
    /// URI of the object, e.g. PYRO:test.echoserver@localhost:9999
    #[argh(positional)]
    uri: String,
}

/// Arguments for making a single remote call.
///
/// Outputs the result as raw JSON on stdout. A method returning a stream
/// prints one line per item.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method of a remote object
struct CallArgs {
    /// URI of the object
    #[argh(positional)]
    uri: String,

    /// name of the method to call
    #[argh(positional)]
    method: String,

    /// JSON array of positional arguments, defaults to `[]`
    #[argh(option, short = 'a', long = "args", default = "\"[]\".into()")]
    args: String,
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call and ping keep stdout clean for scripting
    if matches!(cli.command, Commands::EchoServer(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        // stdout carries the URI; logs go to stderr
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::EchoServer(args) => run_echo_server(args),
        Commands::Ping(args) => run_ping(args),
        Commands::Call(args) => run_call(args),
    }
}

fn run_echo_server(args: EchoServerArgs) -> Result<()> {
    let mut config = Config::from_env()?;
    if args.multiplexed {
        config = config.with_server_type(ServerType::Multiplex);
    }
    let location = match args.unix {
        Some(path) => Location::Unix {
            path: PathBuf::from(path),
        },
        None => pyro_cli::parse_bind(&args.bind)?,
    };

    let daemon = Daemon::new(config);
    let server = Server::bind(Arc::clone(&daemon), &location)?;
    let uri = daemon.register(Arc::new(EchoServer::new(args.verbose)), RegisterOptions::id(ECHO_NAME))?;
    tracing::info!("{}", daemon.info());
    tracing::info!(uri = %uri, "Echo server ready");

    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", uri)?;
    stdout.flush()?;

    server.serve()?;
    Ok(())
}

fn proxy(uri: &str) -> Result<Proxy> {
    let uri: PyroUri = uri.parse()?;
    Ok(Proxy::with_config(uri, Config::from_env()?)?)
}

fn run_ping(args: PingArgs) -> Result<()> {
    let proxy = proxy(&args.uri)?;
    let start = Instant::now();
    proxy.ping()?;
    println!("{} is alive ({:.1} ms)", args.uri, start.elapsed().as_secs_f64() * 1000.0);
    Ok(())
}

fn run_call(args: CallArgs) -> Result<()> {
    let call_args = pyro_cli::parse_call_args(&args.args)?;
    let proxy = proxy(&args.uri)?;
    match proxy.call(&args.method, call_args, serde_json::Map::new())? {
        CallOutcome::Value(value) => println!("{}", serde_json::to_string(&value)?),
        CallOutcome::Stream(stream) => {
            for item in stream {
                println!("{}", serde_json::to_string(&item?)?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_echo_server_defaults() {
        let args: Cli = Cli::from_args(&["pyro"], &["echo-server"]).unwrap();
        match args.command {
            Commands::EchoServer(EchoServerArgs { bind, unix, multiplexed, verbose }) => {
                assert_eq!(bind, "localhost:0");
                assert!(unix.is_none());
                assert!(!multiplexed);
                assert!(!verbose);
            }
            _ => panic!("Expected EchoServer command"),
        }
    }

    #[test]
    fn test_cli_parse_echo_server_options() {
        let args: Cli = Cli::from_args(
            &["pyro"],
            &["echo-server", "-b", "0.0.0.0:9999", "--multiplexed", "--unix", "/tmp/pyro.sock"],
        )
        .unwrap();
        match args.command {
            Commands::EchoServer(EchoServerArgs { bind, unix, multiplexed, .. }) => {
                assert_eq!(bind, "0.0.0.0:9999");
                assert_eq!(unix, Some("/tmp/pyro.sock".to_string()));
                assert!(multiplexed);
            }
            _ => panic!("Expected EchoServer command"),
        }
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = Cli::from_args(
            &["pyro"],
            &["call", "PYRO:obj@localhost:9999", "echo", "-a", "[\"hi\"]"],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs { uri, method, args }) => {
                assert_eq!(uri, "PYRO:obj@localhost:9999");
                assert_eq!(method, "echo");
                assert_eq!(args, "[\"hi\"]");
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_default_args() {
        let args: Cli = Cli::from_args(&["pyro"], &["call", "PYRO:obj@localhost:9999", "ping"]).unwrap();
        match args.command {
            Commands::Call(CallArgs { args, .. }) => assert_eq!(args, "[]"),
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_ping() {
        let args: Cli = Cli::from_args(&["pyro"], &["ping", "PYRO:obj@localhost:9999"]).unwrap();
        assert!(matches!(args.command, Commands::Ping(PingArgs { ref uri }) if uri == "PYRO:obj@localhost:9999"));
    }

    #[test]
    fn test_cli_rejects_missing_method() {
        assert!(Cli::from_args(&["pyro"], &["call", "PYRO:obj@localhost:9999"]).is_err());
    }
}
