//! Interactive shell for docket CLI.
//!
//! Lines accumulate into a fragment until a `%%` line runs it. Kernel
//! state persists between fragments until `:restart`.

use docket_core::{Language, Runner, RunnerConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::colors;
use crate::output::{print_error, print_outcome};

/// A line with meaning to the shell itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the accumulated fragment.
    Run,
    /// Switch the language of following fragments.
    Switch(Language),
    Restart,
    Open,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "%%" => Some(Self::Run),
            ":sql" => Some(Self::Switch(Language::Tabular)),
            ":py" | ":python" => Some(Self::Switch(Language::General)),
            ":restart" => Some(Self::Restart),
            ":open" => Some(Self::Open),
            ":quit" | ":q" => Some(Self::Quit),
            _ => None,
        }
    }
}

/// Run the shell until `:quit` or end of input.
pub async fn execute(config: RunnerConfig) -> anyhow::Result<()> {
    let runner = Runner::new(config)?;
    let result = repl(&runner).await;
    runner.shutdown().await;
    result
}

async fn repl(runner: &Runner) -> anyhow::Result<()> {
    println!(
        "{} (end a fragment with %%, :sql / :py to switch, :restart, :open, :quit)",
        colors::paint(colors::BOLD, "docket shell")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut language = Language::General;
    let mut fragment = String::new();

    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            None => {
                fragment.push_str(&line);
                fragment.push('\n');
            }
            Some(Command::Run) => {
                let code = std::mem::take(&mut fragment);
                run_fragment(runner, &code, language).await;
            }
            Some(Command::Switch(next)) => {
                language = next;
                println!("{}", colors::paint(colors::YELLOW, &format!("language: {}", language)));
            }
            Some(Command::Restart) => match runner.restart().await {
                Ok(()) => println!("{}", colors::paint(colors::GREEN, "kernel restarted")),
                Err(e) => print_error(&e),
            },
            Some(Command::Open) => match runner.notebook_url().await {
                Ok(url) => println!("{}", colors::paint(colors::CYAN, url.as_str())),
                Err(e) => print_error(&e),
            },
            Some(Command::Quit) => return Ok(()),
        }
    }

    // End of input runs whatever is left.
    run_fragment(runner, &fragment, language).await;
    Ok(())
}

async fn run_fragment(runner: &Runner, code: &str, language: Language) {
    let code = code.trim_end();
    if code.trim().is_empty() {
        return;
    }

    let printed = match runner.run_code(code, language, true).await {
        Ok(outcome) => print_outcome(&outcome, true),
        Err(e) => Err(e),
    };
    if let Err(e) = printed {
        print_error(&e);
    }
}
