//! # hubrpc CLI Entry Point
//!
//! Main binary for the hubrpc fabric. Runs the gateway process and makes
//! one-shot RPC calls from the shell.
//!
//! ## Usage
//!
//! ```bash
//! # Run a gateway
//! hubrpc gateway -s /run/hubrpc.sock
//!
//! # Run a gateway speaking MessagePack
//! hubrpc gateway -s /run/hubrpc.sock --codec msgpack
//!
//! # Make an RPC call (outputs raw JSON)
//! hubrpc call -s /run/hubrpc.sock billing post '{"amount": 5}'
//! ```

use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;

use hubrpc_client::{ClientConfig, HandlerRegistry, RpcClient};
use hubrpc_common::codec::Codec;
use hubrpc_gateway::{Gateway, GatewayConfig};

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// hubrpc - in-host RPC fabric over Unix domain sockets
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Gateway(GatewayArgs),
    Call(CallArgs),
}

/// Arguments for running the gateway.
///
/// The gateway is the broker every local service connects to. It unlinks a
/// stale socket file at the given path, listens there, and routes frames
/// between registered services until killed.
#[derive(FromArgs)]
#[argh(subcommand, name = "gateway")]
/// run the hubrpc gateway
struct GatewayArgs {
    /// path of the Unix domain socket to listen on
    #[argh(option, short = 's')]
    socket: String,

    /// payload codec, "json" or "msgpack"
    ///
    /// Every connecting service must be configured with the same codec.
    /// Defaults to "json".
    #[argh(option, long = "codec", default = "\"json\".into()")]
    codec: String,

    /// maximum call depth the router accepts
    ///
    /// CALLs whose context depth exceeds this cap are answered with an
    /// error response. Defaults to 100.
    #[argh(option, long = "max-depth", default = "100")]
    max_depth: u32,
}

/// Arguments for making a single RPC call.
///
/// Connects to the gateway as an ephemeral service, issues one call, and
/// prints the raw JSON result to stdout. Errors go to stderr with a
/// non-zero exit code, so the output stays pipeable (`jq`, `awk`, etc.).
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method on a registered service
struct CallArgs {
    /// path of the gateway's Unix domain socket
    #[argh(option, short = 's')]
    socket: String,

    /// name of the target service
    #[argh(positional)]
    target: String,

    /// name of the method to call
    #[argh(positional)]
    method: String,

    /// JSON string containing the call parameters
    ///
    /// Must be valid JSON. Defaults to `{}`.
    #[argh(positional, default = "\"{}\".into()")]
    params: String,

    /// payload codec, "json" or "msgpack"; must match the gateway
    #[argh(option, long = "codec", default = "\"json\".into()")]
    codec: String,

    /// per-call timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "30000")]
    timeout_ms: u64,

    /// service name to connect under
    ///
    /// Defaults to "hubrpc-cli". Only matters if the callee inspects the
    /// call chain.
    #[argh(option, long = "as", default = "\"hubrpc-cli\".into()")]
    service_name: String,
}

fn parse_codec(name: &str) -> Result<Codec> {
    Codec::from_name(name)
        .ok_or_else(|| anyhow::anyhow!("Unknown codec '{}': expected json or msgpack", name))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // keep `call` output clean for unix tool usage (piping to jq, etc.)
    if matches!(cli.command, Commands::Gateway(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Gateway(args) => run_gateway(args).await,
        Commands::Call(args) => run_call(args).await,
    }
}

async fn run_gateway(args: GatewayArgs) -> Result<()> {
    let codec = parse_codec(&args.codec)?;
    let config = GatewayConfig::new(&args.socket)
        .with_codec(codec)
        .with_max_call_depth(args.max_depth);

    tracing::info!("Starting hubrpc gateway on {}", args.socket);
    let gateway = Gateway::bind(config).await?;
    gateway.run().await?;
    Ok(())
}

async fn run_call(args: CallArgs) -> Result<()> {
    let codec = parse_codec(&args.codec)?;
    let params: serde_json::Value = serde_json::from_str(&args.params)
        .map_err(|e| anyhow::anyhow!("Invalid JSON in params: {}", e))?;

    let config = ClientConfig::new(&args.service_name, &args.socket)
        .with_codec(codec)
        .with_call_timeout(Duration::from_millis(args.timeout_ms))
        .with_auto_reconnect(false);
    let client = RpcClient::new(config, HandlerRegistry::new());
    client.connect().await?;

    let result = client.call(&args.target, &args.method, params).await;
    client.disconnect().await;

    // raw JSON to stdout
    println!("{}", serde_json::to_string(&result?)?);
    Ok(())
}

/// CLI argument parsing tests.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_gateway() {
        let args: Cli = Cli::from_args(&["hubrpc"], &["gateway", "-s", "/tmp/hub.sock"]).unwrap();
        match args.command {
            Commands::Gateway(GatewayArgs {
                socket,
                codec,
                max_depth,
            }) => {
                assert_eq!(socket, "/tmp/hub.sock");
                assert_eq!(codec, "json"); // default
                assert_eq!(max_depth, 100); // default
            }
            _ => panic!("Expected Gateway command"),
        }
    }

    #[test]
    fn test_cli_parse_gateway_with_codec_and_depth() {
        let args: Cli = Cli::from_args(
            &["hubrpc"],
            &[
                "gateway",
                "-s",
                "/tmp/hub.sock",
                "--codec",
                "msgpack",
                "--max-depth",
                "16",
            ],
        )
        .unwrap();
        match args.command {
            Commands::Gateway(GatewayArgs {
                codec, max_depth, ..
            }) => {
                assert_eq!(codec, "msgpack");
                assert_eq!(max_depth, 16);
            }
            _ => panic!("Expected Gateway command"),
        }
    }

    #[test]
    fn test_cli_parse_call_defaults() {
        let args: Cli = Cli::from_args(
            &["hubrpc"],
            &["call", "-s", "/tmp/hub.sock", "billing", "post"],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs {
                socket,
                target,
                method,
                params,
                codec,
                timeout_ms,
                service_name,
            }) => {
                assert_eq!(socket, "/tmp/hub.sock");
                assert_eq!(target, "billing");
                assert_eq!(method, "post");
                assert_eq!(params, "{}"); // default
                assert_eq!(codec, "json"); // default
                assert_eq!(timeout_ms, 30000); // default
                assert_eq!(service_name, "hubrpc-cli"); // default
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_with_params() {
        let args: Cli = Cli::from_args(
            &["hubrpc"],
            &[
                "call",
                "-s",
                "/tmp/hub.sock",
                "billing",
                "post",
                "{\"amount\":5}",
                "--timeout-ms",
                "500",
            ],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs {
                params, timeout_ms, ..
            }) => {
                assert_eq!(params, "{\"amount\":5}");
                assert_eq!(timeout_ms, 500);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_parse_codec_names() {
        assert!(parse_codec("json").is_ok());
        assert!(parse_codec("msgpack").is_ok());
        assert!(parse_codec("protobuf").is_err());
    }
}
