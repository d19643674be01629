use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use geneflow_core::config::EngineConfig;
use geneflow_core::definition::{
    load_app_yaml, load_jobs_yaml, load_workflow_yaml, AppDef, JobDef, StringOrSeq, WorkflowDef,
};
use geneflow_core::store::{FileStore, JobStatus, JobStore};
use geneflow_engine::remote::RemoteAuth;
use geneflow_engine::runtime::{run_job_pool, RuntimeOptions, Update};

#[derive(Parser)]
#[command(author, version, about = "GeneFlow batch workflow engine", long_about = None, disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow
    Run(RunArgs),
    /// Install a workflow package into the local store
    InstallWorkflow(InstallArgs),
    /// Show a workflow's inputs and parameters
    Help {
        /// Workflow definition, package directory, or installed name
        workflow: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Workflow definition, package directory, or name on GENEFLOW_PATH
    workflow: String,

    /// Job definition file (may hold multiple YAML documents)
    #[arg(short = 'j', long = "job")]
    job: Option<PathBuf>,

    /// Override a workflow input: --in key=value
    #[arg(long = "in", value_name = "KEY=VALUE")]
    inputs: Vec<String>,

    /// Override a workflow parameter: --param key=value
    #[arg(long = "param", value_name = "KEY=VALUE")]
    parameters: Vec<String>,

    /// Job output URI
    #[arg(short = 'o', long = "output")]
    output: Option<String>,

    /// Job name
    #[arg(short = 'n', long = "name")]
    name: Option<String>,

    /// Work URI for a data scheme: -w scheme=uri
    #[arg(short = 'w', long = "work", value_name = "SCHEME=URI")]
    work: Vec<String>,

    /// Default execution context
    #[arg(long = "ec")]
    exec_context: Option<String>,

    /// Default execution method
    #[arg(long = "em")]
    exec_method: Option<String>,

    /// Default execution parameter: --ep key=value
    #[arg(long = "ep", value_name = "KEY=VALUE")]
    exec_parameters: Vec<String>,

    /// Pre-delete step output folders before running
    #[arg(short = 'c', long = "clean")]
    clean: bool,
}

#[derive(Args)]
struct InstallArgs {
    /// Workflow package directory
    path: PathBuf,

    /// Re-install over an existing workflow of the same name
    #[arg(short = 'f', long = "force")]
    force: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Run(args) => run(args),
        Commands::InstallWorkflow(args) => install_workflow(args),
        Commands::Help { workflow } => help(&workflow),
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

/// The directory holding the store and config (`~/.geneflow`, or
/// `$GENEFLOW_HOME` when set).
fn geneflow_home() -> Result<PathBuf> {
    if let Ok(home) = env::var("GENEFLOW_HOME") {
        return Ok(PathBuf::from(home));
    }
    let home = env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".geneflow"))
}

/// Resolve a workflow identifier to its definition file: an explicit
/// file, a package directory, or a package found on GENEFLOW_PATH.
fn resolve_workflow_path(identifier: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(identifier);
    if direct.is_file() {
        return Ok(direct);
    }
    if direct.is_dir() {
        let yaml = direct.join("workflow.yaml");
        if yaml.is_file() {
            return Ok(yaml);
        }
    }

    if let Ok(search_path) = env::var("GENEFLOW_PATH") {
        for entry in search_path.split(':').filter(|p| !p.is_empty()) {
            let candidate = Path::new(entry).join(identifier).join("workflow.yaml");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    bail!(
        "workflow \"{}\" not found, check GENEFLOW_PATH",
        identifier
    )
}

/// Load a workflow package: the workflow definition plus every app
/// definition under `apps/*/app.yaml`.
fn load_workflow_package(workflow_yaml: &Path) -> Result<(WorkflowDef, Vec<AppDef>)> {
    let workflow = load_workflow_yaml(workflow_yaml)
        .with_context(|| format!("cannot load workflow {}", workflow_yaml.display()))?;

    let mut apps = Vec::new();
    let apps_dir = workflow_yaml
        .parent()
        .map(|dir| dir.join("apps"))
        .filter(|dir| dir.is_dir());
    if let Some(apps_dir) = apps_dir {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&apps_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().join("app.yaml"))
            .filter(|path| path.is_file())
            .collect();
        entries.sort();
        for app_yaml in entries {
            let app = load_app_yaml(&app_yaml)
                .with_context(|| format!("cannot load app {}", app_yaml.display()))?;
            apps.push(app);
        }
    }

    Ok((workflow, apps))
}

fn split_key_value(raw: &str, flag: &str) -> Result<(String, String)> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| anyhow!("{} expects key=value, got '{}'", flag, raw))
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let workflow_yaml = resolve_workflow_path(&args.workflow)?;
    info!(path = %workflow_yaml.display(), "workflow definition found");
    let (workflow, apps) = load_workflow_package(&workflow_yaml)?;
    let workflow_name = workflow.name.clone();

    let home = geneflow_home()?;
    let mut store = FileStore::open(&home.join("geneflow.json"))?;
    let workflow_id = store.import_workflow(workflow, apps)?;

    // job definitions: from the job file, or one synthesized job
    let mut jobs: Vec<JobDef> = match &args.job {
        Some(path) => load_jobs_yaml(path)
            .with_context(|| format!("cannot load job file {}", path.display()))?,
        None => {
            let output = args
                .output
                .clone()
                .ok_or_else(|| anyhow!("either --job or --output is required"))?;
            let name = args
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-job", workflow_name));
            vec![serde_yaml::from_str(&format!(
                "class: job\nname: {}\noutput_uri: {}\n",
                name, output
            ))?]
        }
    };

    // apply command-line modifiers to every job
    for job in jobs.iter_mut() {
        job.workflow_id = workflow_id.clone();
        job.workflow_name = workflow_name.clone();
        if let Some(output) = &args.output {
            job.output_uri = output.clone();
        }
        if let Some(name) = &args.name {
            job.name = name.clone();
        }
        for raw in &args.inputs {
            let (key, value) = split_key_value(raw, "--in")?;
            job.inputs.insert(key, StringOrSeq::One(value));
        }
        for raw in &args.parameters {
            let (key, value) = split_key_value(raw, "--param")?;
            job.parameters.insert(key, serde_yaml::Value::from(value));
        }
        for raw in &args.work {
            let (scheme, uri) = split_key_value(raw, "--work")?;
            job.work_uri.insert(scheme, uri);
        }
        if let Some(context) = &args.exec_context {
            job.execution
                .context
                .insert("default".to_string(), context.clone());
        }
        if let Some(method) = &args.exec_method {
            job.execution
                .method
                .insert("default".to_string(), method.clone());
        }
        for raw in &args.exec_parameters {
            let (key, value) = split_key_value(raw, "--ep")?;
            job.execution
                .parameters
                .entry("default".to_string())
                .or_default()
                .insert(key, serde_yaml::Value::from(value));
        }
        if job.work_uri.is_empty() {
            // default scratch under the geneflow home
            job.work_uri.insert(
                "local".to_string(),
                home.join("work").to_string_lossy().to_string(),
            );
        }
    }

    let job_ids = store.import_jobs(jobs)?;
    store.commit()?;

    let (update_tx, update_rx) = crossbeam_channel::unbounded::<Update>();
    let printer = thread::spawn(move || {
        for update in update_rx {
            match update {
                Update::Job(job) => {
                    println!("[{}] job \"{}\": {}", &job.job_id[..8], job.name, job.status);
                }
                Update::Step(step) => {
                    println!("[{}] step {}: {}", &step.job_id[..8], step.step_name, step.status);
                }
            }
        }
    });

    let options = RuntimeOptions {
        config: EngineConfig::load(&home.join("config.yaml"))?,
        remote_auth: remote_auth_from_env(),
        updates: Some(update_tx),
        clean: args.clean,
        ..RuntimeOptions::default()
    };

    let results = run_job_pool(&home.join("geneflow.json"), &job_ids, &options);
    drop(options);
    let _ = printer.join();

    let mut all_finished = true;
    for (job_id, status) in &results {
        println!("job {}: {}", job_id, status);
        if *status != JobStatus::Finished {
            all_finished = false;
        }
    }
    Ok(if all_finished {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Remote credentials ride in on the environment; acquiring them is
/// outside the engine.
fn remote_auth_from_env() -> Option<RemoteAuth> {
    let base_url = env::var("GENEFLOW_AGAVE_URL").ok()?;
    let token = env::var("GENEFLOW_AGAVE_TOKEN").ok()?;
    Some(RemoteAuth { base_url, token })
}

fn install_workflow(args: InstallArgs) -> Result<ExitCode> {
    let workflow_yaml = resolve_workflow_path(&args.path.to_string_lossy())?;
    let (workflow, apps) = load_workflow_package(&workflow_yaml)?;
    let name = workflow.name.clone();

    let home = geneflow_home()?;
    let mut store = FileStore::open(&home.join("geneflow.json"))?;
    if !args.force && store.find_workflow_id_by_name(&name).is_some() {
        bail!(
            "workflow \"{}\" is already installed (use --force to re-install)",
            name
        );
    }
    let workflow_id = store.import_workflow(workflow, apps)?;
    store.commit()?;

    println!("installed workflow \"{}\" ({})", name, workflow_id);
    Ok(ExitCode::SUCCESS)
}

fn help(identifier: &str) -> Result<ExitCode> {
    let workflow_yaml = resolve_workflow_path(identifier)?;
    let (workflow, _) = load_workflow_package(&workflow_yaml)?;

    println!("{}: {}", workflow.name, workflow.description);
    if !workflow.version.is_empty() {
        println!("version: {}", workflow.version);
    }

    println!("\ninputs:");
    if workflow.inputs.is_empty() {
        println!("  (none)");
    }
    for (key, input) in &workflow.inputs {
        let default = input.default.as_vec().join(", ");
        println!(
            "  --in {}=<{:?}>  {}  [default: {}]",
            key, input.input_type, input.label, default
        );
    }

    println!("\nparameters:");
    if workflow.parameters.is_empty() {
        println!("  (none)");
    }
    for (key, parameter) in &workflow.parameters {
        println!(
            "  --param {}=<{:?}>  {}  [default: {}]",
            key,
            parameter.param_type,
            parameter.label,
            geneflow_core::definition::scalar_to_string(&parameter.default)
        );
    }

    println!("\nsteps:");
    for (name, step) in &workflow.steps {
        let depends = if step.depend.is_empty() {
            String::new()
        } else {
            format!(" (after {})", step.depend.join(", "))
        };
        println!("  {} -> app {}{}", name, step.app, depends);
    }

    Ok(ExitCode::SUCCESS)
}
