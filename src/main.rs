use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use structopt::StructOpt;

use simplelog::*;

use rust_dott::evaluate::parse_value;
use rust_dott::{SessionConfig, TargetSession, Value};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rust-dott",
    about = "Evaluates expressions and calls functions on a target through GDB."
)]
pub struct Opt {
    /// Session configuration file
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    config: PathBuf,

    /// Download the configured image before anything else
    #[structopt(long = "load")]
    load: bool,

    /// Reset the target and prepare its memory model
    #[structopt(long = "reset")]
    reset: bool,

    /// Set log level
    #[structopt(short = "v", long = "verbosity", default_value = "Warn")]
    verbosity: LevelFilter,

    /// Function calls, e.g. `example_Addition(31, 11)`
    #[structopt(long = "call", number_of_values = 1)]
    calls: Vec<String>,

    /// Expressions to evaluate
    #[structopt(name = "EXPR")]
    expressions: Vec<String>,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    // Setup log
    let cfg = ConfigBuilder::new().build();
    let _ = TermLogger::init(opt.verbosity, cfg, TerminalMode::Mixed);

    let config = SessionConfig::from_file(&opt.config)
        .with_context(|| format!("Failed to read {}", opt.config.display()))?;
    config.memory_model.validate()?;
    if opt.load && config.image.is_none() {
        return Err(anyhow!(config.missing_config()));
    }

    let mut session = TargetSession::connect(config.clone()).context("Failed to connect")?;
    if opt.load {
        if let Some(image) = &config.image {
            session.load_image(image)?;
        }
    }
    if opt.reset || opt.load {
        session.reset()?;
    } else {
        session.halt()?;
    }

    for expression in &opt.expressions {
        match session.evaluate(expression) {
            Ok(value) => println!("{} = {}", expression, value),
            Err(err) => println!("{}: {}", expression, err),
        }
    }
    for call in &opt.calls {
        let (function, arguments) = parse_call(call)?;
        match session.call(&function, &arguments) {
            Ok(value) => println!("{} = {}", call, value),
            Err(err) => println!("{}: {}", call, err),
        }
    }

    session.disconnect()?;
    Ok(())
}

/// Splits `name(arg, ...)` into the function name and its arguments.
fn parse_call(text: &str) -> Result<(String, Vec<Value>)> {
    let text = text.trim();
    let open = text
        .find('(')
        .ok_or_else(|| anyhow!("`{}` is not a call, expected `name(arguments)`", text))?;
    let inner = text[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| anyhow!("`{}` lacks a closing parenthesis", text))?;
    let name = text[..open].trim().to_string();

    let mut arguments = vec![];
    let mut depth = 0;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '{' | '(' if !quoted => depth += 1,
            '}' | ')' if !quoted => depth -= 1,
            ',' if !quoted && depth == 0 => {
                arguments.push(parse_value(&inner[start..i]));
                start = i + 1;
            }
            _ => (),
        }
    }
    if !inner[start..].trim().is_empty() {
        arguments.push(parse_value(&inner[start..]));
    }
    Ok((name, arguments))
}
