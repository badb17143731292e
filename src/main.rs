use clap::Parser;
use log::error;

use inference_engine_rust::{Engine, EngineConfig};

/// GGUF streaming inference engine: prefill a prompt, decode tokens.
#[derive(Parser, Debug)]
#[command(name = "inference_engine_rust", version, about)]
struct Cli {
    /// Path to a GGUF-style model file.
    model: String,

    /// Prompt text to prefill before decoding.
    #[arg(long, default_value = "")]
    prompt: String,

    /// Maximum number of tokens to decode.
    #[arg(long, default_value_t = 16)]
    max_tokens: u32,

    /// Dump prefetcher stats as JSON on exit.
    #[arg(long)]
    stats: bool,

    /// Open the model file via memory map instead of positional reads.
    #[arg(long)]
    use_mmap: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut cfg = EngineConfig::from_env();
    cfg.use_mmap = cli.use_mmap;

    let exit_code = run(&cli, &cfg);
    std::process::exit(exit_code);
}

fn run(cli: &Cli, cfg: &EngineConfig) -> i32 {
    let mut engine = match Engine::open(&cli.model, cfg) {
        Ok(engine) => engine,
        Err(err) => {
            error!("failed to open model: {err}");
            return 1;
        }
    };

    engine.set_prompt(&cli.prompt);
    let output = match engine.generate(cli.max_tokens) {
        Ok(output) => output,
        Err(err) => {
            error!("generation failed: {err}");
            return 1;
        }
    };

    println!("{}", output.text);

    if cli.stats {
        let stats = engine.prefetch_stats();
        match serde_json::to_string_pretty(&stats) {
            Ok(json) => println!("{json}"),
            Err(err) => error!("failed to serialize prefetch stats: {err}"),
        }
    }

    0
}
