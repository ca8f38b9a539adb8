use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};

use devteam::config::Config;
use devteam::core::task::{TaskPriority, TaskStatus, TaskSubmission, TaskType};
use devteam::events::{Event, SubscriptionId};
use devteam::workflow::{feature_template, WorkflowStatus};
use devteam::{dlog, Error, Orchestrator, Result};

/// Devteam - task and workflow orchestration over a team of agents
#[derive(Parser, Debug)]
#[command(name = "devteam")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    DEVTEAM_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.devteam/devteam.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Submit a task and stream its events until it settles
    Run {
        /// Short task title
        title: String,

        /// What the task should accomplish
        description: String,

        /// Task type
        #[arg(long = "type", short = 't', value_enum, default_value_t = TaskType::Feature)]
        task_type: TaskType,

        /// Priority
        #[arg(long, short = 'p', value_enum, default_value_t = TaskPriority::Medium)]
        priority: TaskPriority,

        /// Seconds to wait for the task before giving up
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Start a registered workflow template without a task
    Workflow {
        /// Template id
        template_id: String,

        /// Template parameters as key=value
        #[arg(long = "param", short = 'P')]
        params: Vec<String>,

        /// Seconds to wait for the workflow before giving up
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Print the built-in feature template
    Template {
        #[arg(long, value_enum, default_value_t = Format::Toml)]
        format: Format,
    },

    /// Print the effective configuration
    Config,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load()?;
    devteam::log::init_with_debug(cli.debug || config.debug);

    match cli.command {
        Command::Run {
            title,
            description,
            task_type,
            priority,
            timeout,
        } => {
            let submission =
                TaskSubmission::new(&title, &description, task_type).with_priority(priority);
            run_task(config, submission, Duration::from_secs(timeout))
        }
        Command::Workflow {
            template_id,
            params,
            timeout,
        } => run_workflow(
            config,
            &template_id,
            parse_params(&params)?,
            Duration::from_secs(timeout),
        ),
        Command::Template { format } => {
            let template = feature_template();
            match format {
                Format::Toml => print!("{}", toml::to_string_pretty(&template)?),
                Format::Json => println!("{}", serde_json::to_string_pretty(&template)?),
            }
            Ok(())
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Print every published event as one JSON line on a separate thread, so
/// subscribers never block on stdout.
fn spawn_event_printer(orchestrator: &Orchestrator) -> (SubscriptionId, thread::JoinHandle<()>) {
    let (tx, rx) = crossbeam_channel::unbounded::<Event>();
    let subscription = orchestrator.events().subscribe_all(move |event| {
        // Receiver gone means the printer already stopped.
        let _ = tx.send(event.clone());
        Ok(())
    });

    let printer = thread::spawn(move || {
        for event in rx {
            let line = json!({
                "event_type": event.event_type(),
                "source": event.source(),
                "timestamp": event.timestamp(),
                "data": event.data(),
            });
            println!("{}", line);
        }
    });
    (subscription, printer)
}

fn run_task(config: Config, submission: TaskSubmission, limit: Duration) -> Result<()> {
    dlog!(
        "Run command: type={}, priority={}, title={:?}",
        submission.task_type,
        submission.priority,
        submission.title
    );
    let rt = tokio::runtime::Runtime::new()?;

    let task = rt.block_on(async {
        let orchestrator = Orchestrator::with_builtin_agents(config).await;
        let (subscription, printer) = spawn_event_printer(&orchestrator);
        let handle = orchestrator.start();

        let outcome = match orchestrator.submit(submission).await {
            Ok(id) => orchestrator.wait_for_task(id, limit).await,
            Err(e) => Err(e),
        };

        let clean = handle.shutdown().await?;
        if !clean {
            eprintln!("warning: some agents did not shut down cleanly");
        }
        // Dropping the subscriber closes the channel and ends the printer.
        orchestrator.events().unsubscribe_all(subscription);
        let _ = printer.join();
        outcome
    })?;

    eprintln!();
    eprintln!("  Task:    {}", task.id.short());
    eprintln!("  Status:  {}", format_task_status(task.status));
    if let Some(error) = &task.error {
        eprintln!("  Error:   {}", error);
    }
    if let Some(workflow_id) = task.workflow_id {
        eprintln!("  Workflow: {}", workflow_id.short());
    }

    match task.status {
        TaskStatus::Completed => Ok(()),
        status => Err(Error::Execution(format!("task ended {}", status))),
    }
}

fn run_workflow(
    config: Config,
    template_id: &str,
    params: Map<String, Value>,
    limit: Duration,
) -> Result<()> {
    dlog!("Workflow command: template={}", template_id);
    let rt = tokio::runtime::Runtime::new()?;

    let snapshot = rt.block_on(async {
        let orchestrator = Orchestrator::with_builtin_agents(config).await;
        let (subscription, printer) = spawn_event_printer(&orchestrator);
        let handle = orchestrator.start();

        let outcome = async {
            let id = orchestrator.start_workflow(template_id, params).await?;
            let wait = async {
                loop {
                    let snapshot = orchestrator.workflow_status(id).await?;
                    if snapshot.status.is_terminal() {
                        return Ok::<_, Error>(snapshot);
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            };
            tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Error::Timeout(limit))?
        }
        .await;

        handle.shutdown().await?;
        // Dropping the subscriber closes the channel and ends the printer.
        orchestrator.events().unsubscribe_all(subscription);
        let _ = printer.join();
        outcome
    })?;

    eprintln!();
    eprintln!("  Workflow: {}", snapshot.workflow_id.short());
    eprintln!("  Status:   {}", format_workflow_status(snapshot.status));
    if !snapshot.failed_steps.is_empty() {
        eprintln!("  Failed:   {}", snapshot.failed_steps.join(", "));
    }
    Ok(())
}

fn parse_params(raw: &[String]) -> Result<Map<String, Value>> {
    let mut params = Map::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::Validation(format!("expected key=value, got {:?}", pair)))?;
        params.insert(key.trim().to_string(), Value::String(value.to_string()));
    }
    Ok(params)
}

fn format_task_status(status: TaskStatus) -> String {
    match status {
        TaskStatus::Completed => format!("\x1b[32m{}\x1b[0m", status),
        TaskStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),
        TaskStatus::InProgress => format!("\x1b[33m{}\x1b[0m", status),
        TaskStatus::Cancelled => format!("\x1b[35m{}\x1b[0m", status),
        TaskStatus::Submitted => format!("\x1b[90m{}\x1b[0m", status),
    }
}

fn format_workflow_status(status: WorkflowStatus) -> String {
    match status {
        WorkflowStatus::Completed => format!("\x1b[32m{}\x1b[0m", status),
        WorkflowStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),
        WorkflowStatus::Running => format!("\x1b[33m{}\x1b[0m", status),
        WorkflowStatus::Paused => format!("\x1b[34m{}\x1b[0m", status),
        WorkflowStatus::Cancelled => format!("\x1b[35m{}\x1b[0m", status),
        WorkflowStatus::Created => format!("\x1b[90m{}\x1b[0m", status),
    }
}
