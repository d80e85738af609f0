//! CLI for stageplan
//!
//! - `plan`: build the initialize plan of a stage request
//! - `resources`: peak CPU or memory of a stage
//! - `validate`: structural validation of a stage request
//! - `completions`: generate shell completions
//!
//! A request document is a YAML (or JSON) [`PlanRequest`] carrying the
//! collaborator data the planner would otherwise fetch: connectors, feature
//! flags, the account license and optionally fixed service tokens.

pub mod completions;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use stageplan::infrastructure::init_logging;
use stageplan::infrastructure::services::{
    ConnectorDetails, Edition, FeatureFlag, HttpTokenClient, ServiceKind, ServiceTokenClient,
    StaticConnectors, StaticFeatureFlags, StaticLicense, StaticTokens,
};
use stageplan::pipeline::ResourceKind;
use stageplan::{
    Collaborators, Config, ExecutionPlanOrchestrator, InMemoryStore, InitializePlan,
    JsonFileStore, PlanRequest, StageExecutionError, SweepingOutputStore,
};

/// CLI arguments for stageplan
#[derive(Parser, Debug)]
#[command(name = "stageplan")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Log level, overrides the configured one
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the initialize plan of a stage
    Plan {
        /// Request document
        #[arg(short, long)]
        request: PathBuf,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
        /// Sweeping output file kept between attempts
        #[arg(short, long)]
        state: Option<PathBuf>,
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the peak resource requirement of a stage
    Resources {
        /// Request document
        #[arg(short, long)]
        request: PathBuf,
        /// Resource to compute
        #[arg(short, long, value_enum, default_value_t = KindArg::Cpu)]
        kind: KindArg,
    },

    /// Validate a stage without planning it
    Validate {
        /// Request document
        #[arg(short, long)]
        request: PathBuf,
    },

    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: ShellArg,
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Yaml,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Cpu,
    Memory,
}

impl From<KindArg> for ResourceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Cpu => ResourceKind::Cpu,
            KindArg::Memory => ResourceKind::Memory,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ShellArg {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

/// Stage request plus the collaborator data used to plan it
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDocument {
    #[serde(flatten)]
    pub request: PlanRequest,
    #[serde(default)]
    pub connectors: Vec<ConnectorDetails>,
    #[serde(default)]
    pub feature_flags: Vec<FeatureFlag>,
    #[serde(default)]
    pub license: Option<Edition>,
    /// Fixed tokens; the configured token endpoints are queried when absent
    #[serde(default)]
    pub tokens: Option<BTreeMap<ServiceKind, String>>,
}

impl RequestDocument {
    /// Reads a request document from a YAML or JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse request: {}", path.display()))
    }

    fn token_client(&self, config: &Config) -> Box<dyn ServiceTokenClient> {
        match &self.tokens {
            Some(tokens) => Box::new(
                tokens
                    .iter()
                    .fold(StaticTokens::new(), |client, (service, token)| {
                        client.with_token(*service, token.clone())
                    }),
            ),
            None => Box::new(HttpTokenClient::new(config.services.clone())),
        }
    }

    /// Runs `f` with an orchestrator wired to this document's collaborators
    fn with_orchestrator<T>(
        &self,
        config: &Config,
        outputs: &dyn SweepingOutputStore,
        f: impl FnOnce(&ExecutionPlanOrchestrator<'_>) -> Result<T, StageExecutionError>,
    ) -> Result<T, StageExecutionError> {
        let flags: StaticFeatureFlags = self.feature_flags.iter().copied().collect();
        let connectors: StaticConnectors = self.connectors.iter().cloned().collect();
        let license = StaticLicense(self.license);
        let tokens = self.token_client(config);
        let orchestrator = ExecutionPlanOrchestrator::new(
            config,
            Collaborators {
                flags: &flags,
                connectors: &connectors,
                license: &license,
                tokens: tokens.as_ref(),
                outputs,
            },
        );
        f(&orchestrator)
    }

    /// Plans the stage against `outputs`
    pub fn plan(
        &self,
        config: &Config,
        outputs: &dyn SweepingOutputStore,
    ) -> Result<InitializePlan, StageExecutionError> {
        self.with_orchestrator(config, outputs, |o| o.plan(&self.request))
    }
}

/// Build the CLI command for completion generation
pub fn build_cli() -> clap::Command {
    Args::command()
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn render(plan: &InitializePlan, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(plan).context("Failed to render plan"),
        OutputFormat::Yaml => serde_yaml::to_string(plan).context("Failed to render plan"),
    }
}

fn write_output(content: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, content)
            .with_context(|| format!("Failed to write output to: {}", path.display())),
        None => {
            println!("{content}");
            Ok(())
        }
    }
}

/// Parse and execute CLI arguments
pub fn run() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    if let Some(level) = args.log_level.as_deref() {
        init_logging(level);
    } else if std::env::var("STAGEPLAN_DEBUG").is_ok() {
        init_logging(&config.log_level);
    }

    match args.command {
        Command::Plan {
            request,
            format,
            state,
            output,
        } => {
            let document = RequestDocument::load(&request)?;
            let outputs: Box<dyn SweepingOutputStore> = match state {
                Some(path) => Box::new(JsonFileStore::new(path)),
                None => Box::new(InMemoryStore::new()),
            };
            let plan = document.plan(&config, outputs.as_ref())?;
            write_output(&render(&plan, format)?, output.as_deref())?;
        }
        Command::Resources { request, kind } => {
            let document = RequestDocument::load(&request)?;
            let outputs = InMemoryStore::new();
            let amount = document.with_orchestrator(&config, &outputs, |o| {
                o.stage_requirement(&document.request, kind.into())
            })?;
            println!("{amount}");
        }
        Command::Validate { request } => {
            let document = RequestDocument::load(&request)?;
            let outputs = InMemoryStore::new();
            document.with_orchestrator(&config, &outputs, |o| o.validate(&document.request))?;
            println!("{}: valid", document.request.stage.identifier);
        }
        Command::Completions { shell, output } => {
            use clap_complete::Shell;

            let shell_enum = match shell {
                ShellArg::Bash => Shell::Bash,
                ShellArg::Zsh => Shell::Zsh,
                ShellArg::Fish => Shell::Fish,
                ShellArg::PowerShell => Shell::PowerShell,
            };

            let completions = completions::generate_completions(shell_enum)?;

            if let Some(output_path) = output {
                completions::save_completions(&completions, &output_path)?;
            } else {
                println!("{completions}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stageplan::TaskParams;

    const REQUEST: &str = r#"
ids:
  accountId: acc
  executionId: exec-1
  stageRuntimeId: rt-1
  runSequence: "7"
stage:
  identifier: build
  cloneCodebase: false
  infrastructure:
    type: KubernetesDirect
    spec:
      connectorRef: account.cluster
      namespace: builds
  execution:
    steps:
      - step:
          identifier: compile
          type: Run
          spec:
            image: golang:1.22
            connectorRef: account.docker
            command: go build ./...
connectors:
  - identifier: account.docker
    connectorType: DockerRegistry
    url: https://index.docker.io/v1/
license: TEAM
tokens:
  log: log-token
"#;

    fn document() -> RequestDocument {
        serde_yaml::from_str(REQUEST).unwrap()
    }

    #[test]
    fn test_parse_request_document() {
        let document = document();
        assert_eq!(document.request.stage.identifier, "build");
        assert_eq!(document.request.ids.run_sequence, "7");
        assert_eq!(document.license, Some(Edition::Team));
        assert_eq!(document.connectors.len(), 1);
        assert!(document.feature_flags.is_empty());
    }

    #[test]
    fn test_plan_document() {
        let plan = document()
            .plan(&Config::default(), &InMemoryStore::new())
            .unwrap();
        let TaskParams::Kubernetes(params) = &plan.task else {
            panic!("expected a kubernetes task");
        };
        assert_eq!(params.pod.namespace, "builds");
        assert_eq!(params.pod.lite_engine.env["HARNESS_LOG_SERVICE_TOKEN"], "log-token");
        assert!(render(&plan, OutputFormat::Yaml).unwrap().contains("lite-engine"));
    }

    #[test]
    fn test_state_file_keeps_pod_name() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("outputs.json");
        let document = document();
        let config = Config::default();

        let first = document.plan(&config, &JsonFileStore::new(&state)).unwrap();
        let second = document.plan(&config, &JsonFileStore::new(&state)).unwrap();
        assert_eq!(first.infra_details, second.infra_details);
        assert!(state.exists());
    }

    #[test]
    fn test_missing_config_file() {
        let err = load_config(Some(Path::new("/nonexistent/stageplan.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }

    #[test]
    fn test_cli_definition() {
        build_cli().debug_assert();
    }
}
