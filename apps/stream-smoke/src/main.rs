mod config;
mod logging;

use std::{
    io::{self, Write},
    process::ExitCode,
    sync::Arc,
};

use stream_core::AssistCandidate;
use stream_runtime::{ChatStreamRunner, HttpEventSourceFactory, StreamFinish, StreamRunError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{SmokeConfig, SmokeMode};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid smoke configuration");
            eprintln!("Set STREAM_API_BASE_URL (and optionally STREAM_SMOKE_MODE) to run.");
            return ExitCode::FAILURE;
        }
    };

    match run(&config).await {
        Ok(finish) => {
            info!(?finish, "smoke run complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, category = ?err.category(), "smoke run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &SmokeConfig) -> Result<StreamFinish, StreamRunError> {
    let api = config.api_config()?;
    let factory = HttpEventSourceFactory::with_connect_timeout(config.connect_timeout)
        .map_err(|err| StreamRunError::InvalidRequest(format!("http client: {err}")))?;
    let runner = ChatStreamRunner::new(api, Arc::new(factory));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; cancelling stream");
            interrupt.cancel();
        }
    });

    info!(base_url = %runner.config().base_url(), mode = ?config.mode, "starting smoke run");
    match &config.mode {
        SmokeMode::Assist(action) => {
            let request = config.assist_request(*action);
            let run = runner
                .run_chat_assist(&request, &cancel, |candidates| {
                    info!(count = candidates.len(), "candidates updated");
                })
                .await?;
            print_candidates(&run.candidates);
            Ok(run.finish)
        }
        SmokeMode::Completions => {
            let mut printer = DeltaPrinter::default();
            let run = runner
                .run_chat_completions(&config.completions_request(), &cancel, |text| {
                    printer.print(text)
                })
                .await?;
            println!();
            Ok(run.finish)
        }
        SmokeMode::MiniApp(app_id) => {
            let mut printer = DeltaPrinter::default();
            let run = runner
                .run_mini_app_completions(app_id, &config.completions_request(), &cancel, |text| {
                    printer.print(text)
                })
                .await?;
            println!();
            Ok(run.finish)
        }
    }
}

/// Prints only the part of the accumulated text not yet written.
#[derive(Default)]
struct DeltaPrinter {
    written: usize,
}

impl DeltaPrinter {
    fn print(&mut self, text: &str) {
        let Some(fresh) = text.get(self.written..) else {
            return;
        };
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(fresh.as_bytes());
        let _ = stdout.flush();
        self.written = text.len();
    }
}

fn print_candidates(candidates: &[AssistCandidate]) {
    if candidates.is_empty() {
        println!("(no candidates)");
        return;
    }
    for (index, candidate) in candidates.iter().enumerate() {
        let id = candidate.id.as_deref().unwrap_or("-");
        println!("{:>2}. [{:?}] {id}", index + 1, candidate.kind);
        for line in candidate.text.lines() {
            println!("      {line}");
        }
    }
}
