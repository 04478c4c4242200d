use tamarin::{EvaluationContext, Value};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

async fn query(
    stdout: &mut io::Stdout,
    lines: &mut io::Lines<io::BufReader<io::Stdin>>,
) -> io::Result<Option<String>> {
    stdout.write_all("> ".as_bytes()).await?;
    stdout.flush().await?;
    lines.next_line().await
}

// Reads lines until an empty one, printing every non-null result. The
// context persists, so bindings and macros carry over between lines.
async fn repl() {
    let mut context = EvaluationContext::new();
    let mut lines = io::BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();

    while let Ok(Some(line)) = query(&mut stdout, &mut lines).await {
        if line.trim().is_empty() {
            break;
        }
        match context.evaluate(&line) {
            Ok(value) if value.is_error() => eprintln!("{}", value),
            Ok(Value::Null) => {}
            Ok(value) => println!("{}", value),
            Err(error) => eprintln!("{}", error),
        }
    }
}

fn run_file(path: &str) -> i32 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("{}: {}", path, error);
            return 1;
        }
    };

    let mut context = EvaluationContext::new();
    match context.evaluate(&source) {
        Ok(value) if value.is_error() => {
            eprintln!("{}", value);
            1
        }
        Ok(_) => 0,
        Err(error) => {
            eprintln!("{}", error);
            1
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let code = match args.len() {
        1 => {
            repl().await;
            0
        }
        2 => run_file(&args[1]),
        _ => {
            eprintln!("usage: tamarin [script]");
            2
        }
    };
    std::process::exit(code);
}
