//! skald: command-line front end
//!
//! Runs built-in and configured functions against an OpenAI-compatible
//! backend.

use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use skald::config::{Config, Secrets};
use skald::{ExecutionRequest, InputFields, StreamEvent, encode_frame};
use tokio_util::sync::CancellationToken;

/// Skald CLI
#[derive(Parser)]
#[command(name = "skald")]
#[command(version = skald::PKG_VERSION)]
#[command(about = "Run parameterized AI text functions")]
struct Args {
    /// Config file (default: ~/.skald/config.toml, then /etc/skald/config.toml)
    #[arg(short, long, env = "SKALD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List available functions
    Functions {
        /// Print the full listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a function and print its result
    Run {
        /// Function id
        function: String,
        #[command(flatten)]
        input: InputArgs,
        /// Bypass the response cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Run a function and print tokens as they arrive
    Stream {
        /// Function id
        function: String,
        #[command(flatten)]
        input: InputArgs,
        /// Print raw SSE frames instead of text
        #[arg(long)]
        raw: bool,
    },

    /// Check backend reachability
    Health,
}

#[derive(clap::Args)]
struct InputArgs {
    /// Value for the `text` field (or omit to read from stdin)
    text: Option<String>,
    /// Full input as a JSON object (overrides TEXT)
    #[arg(short, long)]
    input: Option<String>,
    /// Model to use instead of the function default
    #[arg(short, long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    let api_key = Secrets::load()?.api_key().unwrap_or_default();

    let dispatcher = config.builder(api_key.clone()).build()?;

    match args.command {
        Command::Functions { json } => {
            let functions = dispatcher.list_functions();
            if json {
                println!("{}", serde_json::to_string_pretty(&functions)?);
            } else if functions.is_empty() {
                println!("no functions available");
            } else {
                for f in functions {
                    let mode = if f.supports_streaming { "stream" } else { "sync" };
                    println!("{:<24} {:<6} {} - {}", f.id, mode, f.name, f.description);
                }
            }
        }

        Command::Run {
            function,
            input,
            no_cache,
        } => {
            require_key(&api_key)?;
            let request = build_request(function, input, "run")?.use_cache(!no_cache);
            let result = dispatcher.execute(request).await?;
            println!("{}", result.content);
            eprintln!(
                "model: {}  tokens: {}  time: {:.2}s{}",
                result.model_used,
                result.usage.total_tokens,
                result.execution_time,
                if result.cached { "  (cached)" } else { "" }
            );
        }

        Command::Stream {
            function,
            input,
            raw,
        } => {
            require_key(&api_key)?;
            let request = build_request(function, input, "stream")?;
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let mut events = dispatcher.stream_execute(request, cancel)?;
            let mut stdout = io::stdout();
            let mut failed = None;
            while let Some(event) = events.next().await {
                if raw {
                    write!(stdout, "{}", encode_frame(&event)?)?;
                    stdout.flush()?;
                    continue;
                }
                match event {
                    StreamEvent::Token { content, .. } => {
                        write!(stdout, "{content}")?;
                        stdout.flush()?;
                    }
                    StreamEvent::End {
                        usage,
                        execution_time,
                        ..
                    } => {
                        writeln!(stdout)?;
                        eprintln!(
                            "tokens: {}  time: {:.2}s",
                            usage.total_tokens, execution_time
                        );
                    }
                    StreamEvent::Error { message, .. } => failed = Some(message),
                    _ => {}
                }
            }
            if let Some(message) = failed {
                return Err(message.into());
            }
        }

        Command::Health => {
            require_key(&api_key)?;
            dispatcher.health().await?;
            println!("status: ok");
        }
    }

    Ok(())
}

fn require_key(api_key: &str) -> Result<(), Box<dyn std::error::Error>> {
    if api_key.is_empty() {
        return Err(
            "no API key: set api_key in ~/.skald/secrets.toml or export SKALD_API_KEY".into(),
        );
    }
    Ok(())
}

fn build_request(
    function: String,
    args: InputArgs,
    command: &str,
) -> Result<ExecutionRequest, Box<dyn std::error::Error>> {
    let input: InputFields = match args.input {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| format!("{command}: --input must be a JSON object: {e}"))?,
        None => {
            let mut fields = InputFields::new();
            fields.insert(
                "text".into(),
                resolve_text(args.text, command)?.into(),
            );
            fields
        }
    };
    let mut request = ExecutionRequest::new(function, input);
    if let Some(model) = args.model {
        request = request.model(model);
    }
    Ok(request)
}

/// Resolve text input from an optional CLI argument and/or stdin.
///
/// - argument only → argument
/// - stdin only → stdin
/// - both → `"{arg}\n\n{stdin}"`
fn resolve_text(arg: Option<String>, command: &str) -> Result<String, Box<dyn std::error::Error>> {
    let stdin_is_pipe = !io::stdin().is_terminal();
    let stdin_text = if stdin_is_pipe {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        let trimmed = buf.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    } else {
        None
    };

    match (arg, stdin_text) {
        (Some(a), Some(s)) => Ok(format!("{a}\n\n{s}")),
        (Some(a), None) => Ok(a),
        (None, Some(s)) => Ok(s),
        (None, None) => {
            Err(format!("{command}: no input provided (pass text as argument or via stdin)").into())
        }
    }
}
