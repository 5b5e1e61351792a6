//! Command-line driver that runs the demo module under either embedding.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::{unbounded, Receiver};
use futures::executor::block_on;
use modbridge::{callback, EmbeddingKind, HostArray, HostConfig, Param};
use tracing_subscriber::{fmt, EnvFilter};

/// Result formatting.
mod render {
    use modbridge::{Buffer, Param};
    use std::fmt::Write;

    /// One line per param: its index, type and contents.
    pub fn params(params: &[Param]) -> String {
        let mut out = String::new();
        for (idx, param) in params.iter().enumerate() {
            writeln!(out, "[{idx}] {}", param_line(param)).expect("write param");
        }
        if params.is_empty() {
            out.push_str("(no results)\n");
        }
        out
    }

    fn param_line(param: &Param) -> String {
        match param {
            Param::Str(text) => format!("string {text:?}"),
            Param::Buffer(buffer) => {
                let bytes = match buffer.to_vec() {
                    Ok(bytes) => bytes_hex(&bytes),
                    Err(err) => format!("<unreadable: {err}>"),
                };
                let handle = match buffer {
                    Buffer::ReadOnly(view) => view.handle(),
                    Buffer::Mutable(view) => view.handle(),
                };
                format!("{:?} #{handle} {bytes}", buffer.param_type())
            }
            Param::Array(array) => {
                format!("{:?} {}", array.param_type(), bytes_hex(array.bytes()))
            }
        }
    }

    /// Space-separated uppercase hex.
    pub fn bytes_hex(bytes: &[u8]) -> String {
        bytes
            .chunks(1)
            .map(hex::encode_upper)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Call into the demo native module.
#[derive(Parser, Debug)]
#[command(author, version, about = "Drive the demo native module", long_about = None)]
struct Cli {
    /// Embedding to load the module under (defaults to MODBRIDGE_EMBEDDING, then workers).
    #[arg(short, long, value_enum, global = true)]
    embedding: Option<EmbeddingArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call one exported function and print its results.
    Call {
        /// Function name.
        name: String,
        /// String parameter; may be repeated.
        #[arg(long = "text", value_name = "S")]
        texts: Vec<String>,
        /// Byte buffer parameter as hex, e.g. 010203; may be repeated.
        #[arg(long = "bytes", value_name = "HEX", value_parser = parse_hex)]
        buffers: Vec<Vec<u8>>,
        /// Create byte buffers read-only instead of mutable.
        #[arg(long)]
        read_only: bool,
    },
    /// List the functions the demo module exports.
    Functions,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EmbeddingArg {
    /// Run the module on the calling thread.
    InProcess,
    /// Run the module on a dedicated main worker.
    Workers,
}

impl From<EmbeddingArg> for EmbeddingKind {
    fn from(arg: EmbeddingArg) -> Self {
        match arg {
            EmbeddingArg::InProcess => EmbeddingKind::InProcess,
            EmbeddingArg::Workers => EmbeddingKind::Workers,
        }
    }
}

/// Functions whose host callback may land after the call resolves.
const REPORTS_BACK: [&str; 2] = ["ping_host", "spawn_echo"];

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Functions => {
            for name in demo_module::FUNCTIONS {
                println!("{name}");
            }
            Ok(())
        }
        Command::Call {
            name,
            texts,
            buffers,
            read_only,
        } => block_on(call(cli.embedding, &name, texts, buffers, read_only)),
    }
}

async fn call(
    embedding: Option<EmbeddingArg>,
    name: &str,
    texts: Vec<String>,
    buffers: Vec<Vec<u8>>,
    read_only: bool,
) -> Result<()> {
    if !demo_module::FUNCTIONS.contains(&name) {
        bail!(
            "unknown function `{name}` (try one of: {})",
            demo_module::FUNCTIONS.join(", ")
        );
    }

    let mut config = HostConfig::new(demo_module::image());
    if let Some(embedding) = embedding {
        config = config.with_embedding(embedding.into());
    }
    let host = modbridge::initialize(config)
        .await
        .context("failed to load the demo module")?;
    tracing::info!("loaded under the {} embedding", host.embedding_kind());

    let (tx, rx) = unbounded();
    let done = tx.clone();
    host.register_callbacks([
        (
            demo_module::PING_CALLBACK,
            callback(move |params| {
                let _ = tx.send(format!("ping\n{}", render::params(&params)));
            }),
        ),
        (
            demo_module::THREAD_DONE_CALLBACK,
            callback(move |params| {
                let _ = done.send(format!("thread_done\n{}", render::params(&params)));
            }),
        ),
    ])?;

    let mut params: Vec<Param> = texts.into_iter().map(Param::from).collect();
    for bytes in buffers {
        let array = HostArray::u8(bytes);
        let param: Param = if read_only {
            host.create_read_only_buffer(array.read_only()).await?.into()
        } else {
            host.create_mutable_buffer(array).await?.into()
        };
        params.push(param);
    }

    let results = host
        .call_rust(name, params)
        .await
        .with_context(|| format!("call to `{name}` failed"))?;
    print!("{}", render::params(&results));

    if REPORTS_BACK.contains(&name) {
        wait_for_callback(&rx, Duration::from_secs(5))?;
    }
    drain_callbacks(&rx);
    host.shutdown();
    Ok(())
}

fn wait_for_callback(rx: &Receiver<String>, timeout: Duration) -> Result<()> {
    match rx.recv_timeout(timeout) {
        Ok(line) => {
            print!("callback {line}");
            Ok(())
        }
        Err(_) => bail!("no host callback arrived within {timeout:?}"),
    }
}

fn drain_callbacks(rx: &Receiver<String>) {
    for line in rx.try_iter() {
        print!("callback {line}");
    }
}

fn parse_hex(input: &str) -> Result<Vec<u8>, String> {
    let digits: String = input
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect();
    hex::decode(&digits).map_err(|err| format!("invalid hex value '{input}': {err}"))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn hex_arguments_parse() {
        assert_eq!(parse_hex("0x0102ff"), Ok(vec![1, 2, 255]));
        assert_eq!(parse_hex("01 02"), Ok(vec![1, 2]));
        assert!(parse_hex("012").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn hex_render_matches_expectation() {
        assert_snapshot!(render::bytes_hex(&[0x00, 0x1f, 0xa0]), @"00 1F A0");
    }

    #[test]
    fn string_results_render() {
        let params = vec![Param::from("hi")];
        assert_snapshot!(render::params(&params).trim_end(), @r#"[0] string "hi""#);
        assert_snapshot!(render::params(&[]).trim_end(), @"(no results)");
    }

    #[test]
    fn call_requires_a_function_name() {
        let cli = Cli::try_parse_from([
            "bridge-cli", "call", "echo", "--text", "a", "--bytes", "0102",
        ])
        .expect("parse");
        match cli.command {
            Command::Call {
                name,
                texts,
                buffers,
                read_only,
            } => {
                assert_eq!(name, "echo");
                assert_eq!(texts, vec!["a".to_owned()]);
                assert_eq!(buffers, vec![vec![1, 2]]);
                assert!(!read_only);
            }
            Command::Functions => panic!("expected call"),
        }
        assert!(Cli::try_parse_from(["bridge-cli", "call"]).is_err());
    }
}
