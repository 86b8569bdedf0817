//! Sandbox child process: executes exactly one step body and exits.
//!
//! The parent writes one task envelope to stdin; this process interprets
//! the compiled body and writes log lines followed by a single result line
//! to stdout. Exiting without a result line is how a crash looks from the
//! parent's side, and the `exit` op reproduces that deliberately.

use std::io::Write;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use filament::sandbox::runner::{self, BodyEval};
use filament::sandbox::{ChildMessage, ChildResult, StepTask};

fn emit(message: &ChildMessage) {
    let mut stdout = std::io::stdout().lock();
    if let Ok(line) = serde_json::to_vec(message) {
        let _ = stdout.write_all(&line);
        let _ = stdout.write_all(b"\n");
        let _ = stdout.flush();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut line = String::new();
    stdin
        .read_line(&mut line)
        .await
        .context("reading the task envelope")?;
    let task: StepTask =
        serde_json::from_str(line.trim_end()).context("parsing the task envelope")?;

    let result = match runner::interpret(&task.body, task.input, |level, message| {
        emit(&ChildMessage::Log {
            level: level.to_string(),
            message: message.to_string(),
        });
    })
    .await
    {
        BodyEval::Complete(state) => ChildResult::Success { state },
        BodyEval::Failed(error) => ChildResult::Fail { error },
        BodyEval::Exit(code) => {
            // No result line on purpose.
            std::process::exit(code);
        }
    };

    emit(&ChildMessage::Result { result });
    Ok(())
}
