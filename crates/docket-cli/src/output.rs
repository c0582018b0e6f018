//! Printing of execution outcomes.

use docket_core::{ExecutionOutcome, Insertion};

use crate::colors;

/// Print what a fragment produced.
///
/// Blocks go to stdout so they can be piped into a document; notices go
/// to stderr.
pub fn print_outcome(outcome: &ExecutionOutcome, leading_blank: bool) -> docket_core::Result<()> {
    match docket_core::format(outcome)? {
        Insertion::Block(block) if leading_blank => {
            println!("{}", docket_core::insertion_text(&block));
        }
        Insertion::Block(block) => println!("{}", block),
        Insertion::Nothing => {
            eprintln!("{}", colors::paint(colors::DIM, "success; no output"));
        }
    }
    Ok(())
}

/// Print a core error with its recovery hint.
pub fn print_error(err: &docket_core::Error) {
    eprintln!("{} {}", colors::paint(colors::RED, "error:"), err.with_hint());
}
