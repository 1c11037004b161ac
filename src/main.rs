//! Gated REPL CLI
//!
//! Runs a script, or the fenced ```repl / ```python blocks of a markdown
//! file, through one review-gated session.

use std::io::Read;
use std::process::ExitCode;

use gated_repl::{
    check_for_final_answer, find_code_blocks, FinalAnswer, ReplConfig, ReplService, RunOutcome,
    SecurityFilter, SecurityLevel, SessionOptions,
};

struct Args {
    config: Option<String>,
    level: Option<SecurityLevel>,
    approve_all: bool,
    input: Option<String>,
}

fn usage(program: &str) {
    eprintln!("Usage: {} [--config FILE] [--level none|basic|strict] [--approve-all] [FILE]", program);
    eprintln!("\nRuns FILE (or stdin) through a review-gated REPL session.");
    eprintln!("Markdown input runs each ```repl or ```python block in order.");
    eprintln!("\nUnder --level strict every block needs review; --approve-all approves");
    eprintln!("blocks the denylist does not flag and rejects the rest.");
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        config: None,
        level: None,
        approve_all: false,
        input: None,
    };
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                parsed.config = Some(iter.next().ok_or("--config needs a file")?.clone());
            }
            "--level" => {
                let level = iter.next().ok_or("--level needs a value")?;
                parsed.level = Some(level.parse::<SecurityLevel>()?);
            }
            "--approve-all" => parsed.approve_all = true,
            flag if flag.starts_with("--") => return Err(format!("unknown flag {}", flag)),
            path => {
                if parsed.input.replace(path.to_string()).is_some() {
                    return Err("only one input file may be given".to_string());
                }
            }
        }
    }
    Ok(parsed)
}

fn read_input(path: Option<&str>) -> std::io::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let program = argv.first().map(String::as_str).unwrap_or("gated-repl");
    if argv.iter().any(|a| a == "-h" || a == "--help") {
        usage(program);
        return ExitCode::SUCCESS;
    }
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            usage(program);
            return ExitCode::from(2);
        }
    };

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns false if any block was rejected or failed.
async fn run(args: Args) -> gated_repl::Result<bool> {
    let mut config = match &args.config {
        Some(path) => ReplConfig::load(path)?,
        None => ReplConfig::default(),
    };
    if let Some(level) = args.level {
        config.security_level = level;
    }
    let reviewer = SecurityFilter::new(config.denylist.clone());
    let service = ReplService::new(config)?;

    let text = read_input(args.input.as_deref())?;
    let blocks = if text.contains("```") {
        find_code_blocks(&text)
    } else {
        vec![text]
    };
    if blocks.is_empty() {
        tracing::warn!("no ```repl or ```python blocks found in input");
        return Ok(true);
    }

    let id = service.open_session(SessionOptions::default()).await?;
    let mut clean = true;

    for (index, code) in blocks.iter().enumerate() {
        tracing::info!(session_id = %id, block = index + 1, total = blocks.len(), "Running block");

        let result = match service.run_code(&id, code).await? {
            RunOutcome::Executed(result) => result,
            RunOutcome::Rejected { stderr, .. } => {
                eprintln!("{}", stderr);
                clean = false;
                continue;
            }
            RunOutcome::PendingReview { advisory, .. } => {
                let verdict = reviewer.check(code, SecurityLevel::Basic);
                if args.approve_all && verdict.allowed {
                    service.resolve_review(&id, true, None).await?;
                    service.execute(&id).await?
                } else {
                    let reason = if verdict.allowed {
                        "Rejected: review required (pass --approve-all)".to_string()
                    } else {
                        advisory
                    };
                    service.resolve_review(&id, false, Some(&reason)).await?;
                    eprintln!("Security Error: {}", reason);
                    clean = false;
                    continue;
                }
            }
        };

        print!("{}", result.stdout);
        if !result.success {
            eprintln!("{}", result.stderr);
            clean = false;
        }

        if let Some(answer) = check_for_final_answer(&result.stdout) {
            let response = service.finalize(&id, FinalAnswer::Text(answer)).await?;
            println!("Final answer: {}", response.answer);
            break;
        }
    }

    Ok(clean)
}
