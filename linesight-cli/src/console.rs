// Linesight operator console
// Line-oriented command loop; status events print while commands are typed

use anyhow::Result;
use linesight_core::{PipelineController, PipelineEvent};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};

pub struct OperatorConsole {
    controller: PipelineController,
    json: bool,
}

enum Reply {
    Output(String),
    Exit,
}

impl OperatorConsole {
    pub fn new(controller: PipelineController, json: bool) -> Self {
        Self { controller, json }
    }

    /// Read commands from stdin until `quit` or end of input
    pub async fn run(&mut self) -> Result<()> {
        self.print_help();
        let printer = tokio::spawn(print_events(self.controller.subscribe(), self.json));
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            print!("linesight> ");
            std::io::stdout().flush()?;

            let Some(line) = lines.next_line().await? else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match self.handle_command(line).await {
                Ok(Reply::Output(text)) => println!("{}", text),
                Ok(Reply::Exit) => break,
                Err(e) => println!("error: {:#}", e),
            }
        }

        printer.abort();
        self.controller.stop().await?;
        println!("Goodbye");
        Ok(())
    }

    async fn handle_command(&mut self, line: &str) -> Result<Reply> {
        let reply = match line.to_ascii_lowercase().as_str() {
            "collect" | "c" => {
                self.controller.start_collecting().await?;
                Reply::Output("collection mode running".to_string())
            }
            "classify" | "k" => {
                self.controller.start_classifying().await?;
                Reply::Output("classification mode running".to_string())
            }
            "stop" | "s" => {
                self.controller.stop().await?;
                Reply::Output("idle".to_string())
            }
            "status" | "st" => {
                let state = self.controller.status();
                if self.json {
                    Reply::Output(serde_json::to_string_pretty(&state)?)
                } else {
                    Reply::Output(state.summary())
                }
            }
            "report" | "r" => {
                let summary = self.controller.report().await?;
                if self.json {
                    Reply::Output(serde_json::to_string_pretty(&summary)?)
                } else {
                    Reply::Output(summary.to_string())
                }
            }
            "rotate" => {
                match self.controller.rotate().await? {
                    Some(archived) => Reply::Output(format!("previous results kept at {}", archived.display())),
                    None => Reply::Output("no results to rotate".to_string()),
                }
            }
            "help" | "?" => {
                self.print_help();
                Reply::Output(String::new())
            }
            "quit" | "exit" | "q" => Reply::Exit,
            other => Reply::Output(format!("unknown command '{}'; type 'help'", other)),
        };
        Ok(reply)
    }

    fn print_help(&self) {
        println!("Commands:");
        println!("  collect, c     - start collection mode");
        println!("  classify, k    - start classification mode");
        println!("  stop, s        - return to idle");
        println!("  status, st     - show mode, counters and last error");
        println!("  report, r      - summarize the results store");
        println!("  rotate         - start a fresh results file");
        println!("  quit, q        - stop the pipeline and exit");
    }
}

async fn print_events(mut events: broadcast::Receiver<PipelineEvent>, json: bool) {
    loop {
        match events.recv().await {
            // per-detection lines would drown the prompt
            Ok(PipelineEvent::Detected { .. }) => {}
            Ok(event) => {
                if let Err(e) = crate::print_event(&event, json) {
                    tracing::warn!("Cannot print event: {}", e);
                }
            }
            Err(RecvError::Lagged(missed)) => tracing::warn!("Missed {} status events", missed),
            Err(RecvError::Closed) => break,
        }
    }
}
