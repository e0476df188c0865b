//! RRVM command-line driver.
//!
//! Usage:
//!   rrvm <file.rr>        Parse and interpret a file
//!   rrvm --tac <file.rr>  Lower to TAC and dump to opt/tmp/raw/<name>.pl
//!   rrvm -                Read from stdin

use std::process::ExitCode;

use rrvm::tac::dump;
use rrvm::{Interp, TacLower, parse, run};

const USAGE: &str = "\
Usage: rrvm [OPTIONS] <FILE>

Arguments:
  <FILE>  RRVM assembly source (.rr), or '-' for stdin

Options:
  --tac       Lower to TAC and write opt/tmp/raw/<basename>.pl
              instead of interpreting
  -h, --help  Print this help message";

enum Action {
    Run { path: String, tac: bool },
    Help,
}

fn parse_args() -> Result<Action, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [arg] if arg == "-h" || arg == "--help" => Ok(Action::Help),
        [path] if path != "--tac" => Ok(Action::Run {
            path: path.clone(),
            tac: false,
        }),
        [flag, path] if flag == "--tac" => Ok(Action::Run {
            path: path.clone(),
            tac: true,
        }),
        [path, flag] if flag == "--tac" => Ok(Action::Run {
            path: path.clone(),
            tac: true,
        }),
        _ => Err(USAGE.into()),
    }
}

fn main() -> ExitCode {
    let action = match parse_args() {
        Ok(action) => action,
        Err(usage) => {
            eprintln!("{usage}");
            return ExitCode::from(2);
        }
    };

    let (path, tac) = match action {
        Action::Help => {
            println!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Action::Run { path, tac } => (path, tac),
    };

    let mut vm = match parse::parse_file(&path) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("{path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    if tac {
        let mut lower = TacLower::new();
        if let Err(e) = run(&mut vm, &mut lower) {
            eprintln!("{path}: {e}");
            return ExitCode::FAILURE;
        }
        if let Err(e) = dump::dump_to_file(lower.program(), &path) {
            eprintln!("{path}: cannot write TAC dump: {e}");
            return ExitCode::FAILURE;
        }
    } else {
        let mut interp = Interp::new();
        if let Err(e) = run(&mut vm, &mut interp) {
            eprintln!("{path}: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
