//! stage-harness - run a pipeline policy from the command line

use clap::{Parser, Subcommand};
use stage_harness::error::{HarnessError, HarnessResult};
use stage_harness::events::{EventBroker, InMemoryBroker};
use stage_harness::logger::{self, Verbosity};
use stage_harness::value::PropertySet;
use stage_harness::{Pipeline, PipelineConfig, StageRegistry};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "stage-harness")]
#[command(about = "Multi-stage, multi-worker pipeline harness")]
#[command(version)]
struct Cli {
    /// Log verbosity: silent, quiet, info, verb1, debug, verb2, verb3 or trace
    #[arg(short, long, global = true, default_value = "info")]
    verbosity: Verbosity,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline policy until it stops, then print the run summary
    Run {
        /// Policy file (JSON)
        policy: PathBuf,

        /// Identifier for this run (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,

        /// Event to publish before the run starts, as TOPIC=JSON
        #[arg(long = "trigger", value_name = "TOPIC=JSON")]
        triggers: Vec<String>,

        /// Print the summary on a single line
        #[arg(long)]
        compact: bool,
    },
    /// Validate a policy and check that every stage class is known
    Check {
        /// Policy file (JSON)
        policy: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logger::init(cli.verbosity) {
        eprintln!("{}", e);
    }

    match execute(cli.command) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Commands) -> HarnessResult<ExitCode> {
    match command {
        Commands::Run {
            policy,
            run_id,
            triggers,
            compact,
        } => {
            let config = PipelineConfig::from_file(&policy)?;
            let registry = StageRegistry::with_builtins();
            let broker = Arc::new(InMemoryBroker::new(config.event_broker_host.clone()));

            for trigger in &triggers {
                let (topic, payload) = parse_trigger(trigger)?;
                broker.publish(&topic, payload)?;
            }

            let summary = Pipeline::launch(config, registry, broker, run_id)?;
            let json = if compact {
                serde_json::to_string(&summary)?
            } else {
                serde_json::to_string_pretty(&summary)?
            };
            println!("{}", json);

            if summary.slices_clean() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(2))
            }
        }
        Commands::Check { policy } => {
            let config = PipelineConfig::from_file(&policy)?;
            StageRegistry::with_builtins().check(&config)?;
            println!(
                "{}: {} stages, {} slices",
                config.name,
                config.stage_count(),
                config.n_slices
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Split `TOPIC=JSON` into a topic and its payload
fn parse_trigger(trigger: &str) -> HarnessResult<(String, PropertySet)> {
    let (topic, json) = trigger.split_once('=').ok_or_else(|| {
        HarnessError::Configuration(format!("Trigger '{}' is not TOPIC=JSON", trigger))
    })?;
    if topic.trim().is_empty() {
        return Err(HarnessError::Configuration(format!(
            "Trigger '{}' has no topic",
            trigger
        )));
    }
    let payload: PropertySet = serde_json::from_str(json)?;
    Ok((topic.trim().to_string(), payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trigger() {
        let (topic, payload) = parse_trigger(r#"triggerVisit={"visitId": 3}"#).unwrap();
        assert_eq!(topic, "triggerVisit");
        assert_eq!(payload.get_i64("visitId"), Some(3));
    }

    #[test]
    fn test_parse_trigger_rejects_garbage() {
        assert!(parse_trigger("no-separator").is_err());
        assert!(parse_trigger(r#"={"a": 1}"#).is_err());
        assert!(parse_trigger("topic=not json").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "stage-harness",
            "-v",
            "debug",
            "run",
            "policy.json",
            "--trigger",
            "a={}",
            "--trigger",
            "b={}",
        ])
        .unwrap();
        assert_eq!(cli.verbosity, Verbosity::Debug);
        match cli.command {
            Commands::Run { triggers, run_id, .. } => {
                assert_eq!(triggers.len(), 2);
                assert!(run_id.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
