//! Oracle-driven deployment runner.
//!
//! Walks a deployment plan step by step, asking an external decision oracle
//! for one action at a time and running the proposed commands locally or over
//! SSH with idle/total timeouts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use deployer::core::budget::{CommandBudget, budget_for_command};
use deployer::core::state::{RepositoryInfo, TargetInfo};
use deployer::core::types::{Plan, RunStatus};
use deployer::exit_codes;
use deployer::io::config::{DeployerConfig, load_config};
use deployer::io::interaction::{AutoInteraction, InteractionHandler, TerminalInteraction};
use deployer::io::oracle::CommandOracle;
use deployer::io::plan_store::load_plan;
use deployer::io::session::{CommandSession, LocalSession, SshSession, SshTarget};
use deployer::logging;
use deployer::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(
    name = "deployer",
    version,
    about = "Oracle-driven step orchestration for multi-step deployments"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a deployment plan.
    Run(RunArgs),
    /// Validate a plan and print its step overview.
    CheckPlan {
        #[arg(long)]
        plan: PathBuf,
    },
    /// Run one command through a session with idle/total timeouts.
    Exec(ExecArgs),
}

#[derive(Args)]
struct TargetArgs {
    /// Run commands on a remote host (`user@host`) instead of locally.
    #[arg(long, value_name = "USER@HOST")]
    ssh: Option<String>,
    #[arg(long, default_value_t = 22)]
    port: u16,
    /// SSH private key.
    #[arg(long)]
    identity: Option<PathBuf>,
    /// Working directory for commands (local path, or remote path with `--ssh`).
    #[arg(long)]
    workdir: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long, default_value = "deployer.toml")]
    config: PathBuf,
    #[command(flatten)]
    target: TargetArgs,
    /// Repository being deployed; used for the project name and run log.
    #[arg(long)]
    repo_url: Option<String>,
    /// Directory the application is deployed into on the target.
    #[arg(long)]
    deploy_dir: Option<String>,
    /// Overrides `[log] dir` from the config.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Answer every question with its default.
    #[arg(long)]
    non_interactive: bool,
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args)]
struct ExecArgs {
    #[command(flatten)]
    target: TargetArgs,
    #[arg(long, default_value = "deployer.toml")]
    config: PathBuf,
    /// Total timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,
    /// Idle timeout in seconds.
    #[arg(long)]
    idle_timeout: Option<u64>,
    #[arg(last = true, required = true, num_args = 1..)]
    command: Vec<String>,
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::CheckPlan { plan } => cmd_check_plan(&plan),
        Command::Exec(args) => cmd_exec(args),
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    logging::init(args.verbose);
    let mut config = load_config(&args.config)?;
    if let Some(dir) = args.log_dir {
        config.log.dir = dir;
    }
    let plan = load_plan(&args.plan)?;

    let session = build_session(&args.target, &config)?;
    let target = target_info(&args.target);
    let repo_url = match args.repo_url {
        Some(url) => url,
        None => current_dir()?.display().to_string(),
    };
    let deploy_dir = match (args.deploy_dir, &args.target.workdir) {
        (Some(dir), _) => dir,
        (None, Some(dir)) => dir.clone(),
        (None, None) => current_dir()?.display().to_string(),
    };
    let repository = RepositoryInfo {
        url: repo_url,
        deploy_dir,
        description: String::new(),
    };

    let oracle = CommandOracle {
        command: config.oracle.command.clone(),
        workdir: None,
        timeout: config.oracle.timeout(),
        output_limit_bytes: config.oracle.output_limit_bytes,
    };
    let handler: Box<dyn InteractionHandler> = if args.non_interactive {
        Box::new(AutoInteraction)
    } else {
        Box::new(TerminalInteraction)
    };

    let orchestrator = Orchestrator::new(
        &oracle,
        session.as_ref(),
        handler.as_ref(),
        &config,
        target,
        repository,
    );
    let outcome = orchestrator.run(&plan)?;
    println!("run log: {}", outcome.log_path.display());
    Ok(exit_code_for(outcome.status))
}

fn cmd_check_plan(path: &Path) -> Result<i32> {
    let plan = load_plan(path)?;
    print!("{}", plan_overview(&plan));
    Ok(exit_codes::OK)
}

fn cmd_exec(args: ExecArgs) -> Result<i32> {
    logging::init(false);
    let config = load_config(&args.config)?;
    let session = build_session(&args.target, &config)?;
    let command = shell_words::join(&args.command);
    let budget: CommandBudget = budget_for_command(
        &command,
        &config.commands.timeouts,
        args.timeout,
        args.idle_timeout,
    );

    let outcome = session.run(&command, budget);
    print!("{}", outcome.stdout);
    eprint!("{}", outcome.stderr);
    if let Some(kind) = outcome.timeout {
        eprintln!("command stopped by {kind:?} timeout after {} ms", outcome.duration_ms);
    }
    Ok(if outcome.succeeded() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn build_session(args: &TargetArgs, config: &DeployerConfig) -> Result<Box<dyn CommandSession>> {
    let capture = config.commands.capture_limit_bytes;
    match &args.ssh {
        Some(spec) => {
            let mut target = SshTarget::parse(spec);
            target.port = args.port;
            target.identity_file = args.identity.clone();
            target.workdir = args.workdir.clone();
            Ok(Box::new(SshSession::new(target, capture)))
        }
        None => {
            let workdir = match &args.workdir {
                Some(dir) => PathBuf::from(dir),
                None => current_dir()?,
            };
            Ok(Box::new(LocalSession::new(
                config.commands.shell.clone(),
                workdir,
                capture,
            )))
        }
    }
}

fn target_info(args: &TargetArgs) -> TargetInfo {
    match &args.ssh {
        Some(spec) => {
            let target = SshTarget::parse(spec);
            TargetInfo {
                mode: "ssh".to_string(),
                host: Some(target.host),
                user: Some(target.user),
                description: String::new(),
            }
        }
        None => TargetInfo {
            mode: "local".to_string(),
            host: None,
            user: None,
            description: String::new(),
        },
    }
}

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().context("resolve current directory")
}

fn plan_overview(plan: &Plan) -> String {
    let mut out = format!("strategy: {}\n", plan.strategy);
    if let Some(estimate) = &plan.estimated_time {
        out.push_str(&format!("estimated time: {estimate}\n"));
    }
    for (i, step) in plan.steps.iter().enumerate() {
        out.push_str(&format!(
            "{}. [{}] {} (id {})",
            i + 1,
            step.category.as_str().to_uppercase(),
            step.name,
            step.id
        ));
        if !step.depends_on.is_empty() {
            let deps: Vec<String> = step.depends_on.iter().map(|d| d.to_string()).collect();
            out.push_str(&format!(" after {}", deps.join(", ")));
        }
        out.push('\n');
    }
    out
}

fn exit_code_for(status: RunStatus) -> i32 {
    match status {
        RunStatus::Success => exit_codes::OK,
        RunStatus::Failed | RunStatus::Running => exit_codes::FAILED,
        RunStatus::Aborted => exit_codes::ABORTED,
    }
}
