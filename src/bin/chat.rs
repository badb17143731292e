//! Thin interactive REPL over `Engine`: one `set_prompt`/`generate`
//! round-trip per input line.

use std::io::{self, BufRead, Write};

use clap::Parser;
use log::error;

use inference_engine_rust::{Engine, EngineConfig};

#[derive(Parser, Debug)]
#[command(name = "chat", about = "Interactive REPL over the inference engine")]
struct Cli {
    model: String,

    #[arg(long, default_value_t = 64)]
    max_tokens: u32,

    #[arg(long)]
    use_mmap: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut cfg = EngineConfig::from_env();
    cfg.use_mmap = cli.use_mmap;

    let mut engine = match Engine::open(&cli.model, &cfg) {
        Ok(engine) => engine,
        Err(err) => {
            error!("failed to open model: {err}");
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        engine.set_prompt(line);
        match engine.generate(cli.max_tokens) {
            Ok(output) => println!("{}", output.text),
            Err(err) => error!("generation failed: {err}"),
        }
    }
}
