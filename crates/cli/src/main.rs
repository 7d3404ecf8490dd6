use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::core::DynamicObject;
use kview_controller::ControllerConfig;
use kview_core::{DryRunResult, ObjectReader, ObjectRef, ObjectTreeNode, ObjectType};
use kview_eval::{EvalLimits, StateEvaluator};
use kview_kubehub::LiveClient;
use kview_ownership::defaults::cluster_type;
use kview_ownership::{default_rules, OwnershipRules, TreeBuilder, TreeConfig, DEFAULT_STATE_EXPRESSION};
use kview_plan::{PlanConfig, PlanGenerator, ReconcilerSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kviewctl", version, about = "Reconciliation views and dry-run plans")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the view controller against the current context
    Run {
        /// Flush interval for watch batches and view updates
        #[arg(long = "batch-ms", env = "KVIEW_BATCH_MS")]
        batch_ms: Option<u64>,
    },
    /// Print the live object tree of a root using the default rules
    Tree {
        /// GVK key, e.g. "apps.kubeblocks.io/v1/Cluster"
        gvk: String,
        name: String,
        /// Levels to print; 0 prints everything
        #[arg(long = "depth", default_value_t = 0)]
        depth: usize,
    },
    /// Dry-run a desired spec against a live Cluster
    Plan {
        /// Cluster name
        name: String,
        /// YAML merged into the Cluster's spec
        #[arg(long = "desired-spec")]
        desired_spec: std::path::PathBuf,
        /// Fixed-point budget in milliseconds
        #[arg(long = "timeout-ms", env = "KVIEW_PLAN_TIMEOUT_MS")]
        timeout_ms: Option<u64>,
    },
    /// Evaluate a state expression against an object file
    Eval {
        #[arg(long = "expr", default_value = DEFAULT_STATE_EXPRESSION)]
        expr: String,
        /// YAML or JSON object
        #[arg(long = "file")]
        file: std::path::PathBuf,
    },
    /// Print and validate the default ownership rules
    Rules,
}

fn init_tracing() {
    let env = std::env::var("KVIEW_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KVIEW_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KVIEW_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { batch_ms } => {
            let mut config = ControllerConfig::from_env();
            if let Some(ms) = batch_ms {
                config.batch = std::time::Duration::from_millis(ms);
            }
            info!(?config, "run invoked");
            kview_controller::live::run(config, Arc::new(ReconcilerSet::default())).await?;
        }
        Commands::Tree { gvk, name, depth } => {
            let object_type = ObjectType::parse_key(&gvk)?;
            let (live, namespace) = connect(cli.namespace).await?;
            let rules = supported_rules(&live);
            let key = ObjectRef::new(object_type, Some(&namespace), name);
            info!(root = %key, "tree invoked");
            let root = live.get(&key).await.with_context(|| format!("reading {key}"))?;
            let mut tree = TreeBuilder::new(&rules, live.registry(), TreeConfig::from_env()).build(&root, &live).await?.tree;
            tree.truncate(depth);
            match cli.output {
                Output::Human => print_tree(&tree, 0),
                Output::Json => println!("{}", serde_json::to_string_pretty(&tree)?),
            }
        }
        Commands::Plan { name, desired_spec, timeout_ms } => {
            let yaml = std::fs::read_to_string(&desired_spec).with_context(|| format!("reading {}", desired_spec.display()))?;
            let (live, namespace) = connect(cli.namespace).await?;
            let rules = Arc::new(supported_rules(&live));
            let mut config = PlanConfig::from_env();
            if let Some(ms) = timeout_ms {
                config.timeout = std::time::Duration::from_millis(ms);
            }
            let root = ObjectRef::new(cluster_type(), Some(&namespace), name);
            info!(root = %root, "plan invoked");
            let planner = PlanGenerator::new(rules, Arc::new(live.registry().clone()), Arc::new(ReconcilerSet::default()))
                .with_config(config)
                .with_tree_config(TreeConfig::from_env());
            let result = planner.generate(&root, &yaml, &live, &CancellationToken::new()).await?;
            match cli.output {
                Output::Human => print_plan(&result),
                Output::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            }
        }
        Commands::Eval { expr, file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let obj: DynamicObject = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;
            let state = StateEvaluator::new(EvalLimits::from_env()).evaluate(&obj, &expr)?;
            match cli.output {
                Output::Human => println!("{state}"),
                Output::Json => println!("{}", serde_json::json!({ "expression": expr, "state": state })),
            }
        }
        Commands::Rules => {
            let rules = default_rules();
            rules.validate()?;
            match cli.output {
                Output::Human => {
                    for rule in rules.rules() {
                        for owned in &rule.owned_resources {
                            println!("{} -> {} ({:?})", rule.primary, owned.secondary, owned.criteria.validation);
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rules)?),
            }
        }
    }
    Ok(())
}

async fn connect(namespace: Option<String>) -> Result<(LiveClient, String)> {
    let client = kview_kubehub::connect().await?;
    let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_string());
    let discovered = kview_kubehub::discover(client.clone()).await?;
    if discovered.registry.is_empty() {
        bail!("discovery returned no resources");
    }
    Ok((LiveClient::new(client, Arc::new(discovered)), namespace))
}

fn supported_rules(live: &LiveClient) -> OwnershipRules {
    let rules = default_rules().filter_unsupported(live.registry());
    if rules.is_empty() {
        warn!("no default rule type is served by this cluster");
    }
    rules
}

fn print_tree(node: &ObjectTreeNode, level: usize) {
    let r = &node.primary;
    let ns = if r.namespace.is_empty() { "-" } else { r.namespace.as_str() };
    println!("{:indent$}{}/{} {}/{} rv={}", "", r.api_version, r.kind, ns, r.name, r.resource_version, indent = level * 2);
    for child in &node.secondaries {
        print_tree(child, level + 1);
    }
}

fn print_plan(result: &DryRunResult) {
    println!("phase: {:?}", result.phase);
    if let Some(reason) = &result.reason {
        println!("reason: {reason}");
    }
    if let Some(message) = &result.message {
        println!("message: {message}");
    }
    if !result.spec_diff.is_empty() {
        println!("spec diff:\n{}", result.spec_diff);
    }
    println!("REVISION  CHANGE      OBJECT");
    for c in &result.plan.changes {
        let r = &c.object_reference;
        println!("{:<9} {:<11} {}/{} {}", c.revision, c.change_type.to_string(), r.api_version, r.kind, r.name);
    }
    for s in &result.plan.summary.object_summaries {
        let cs = s.change_summary.clone().unwrap_or_default();
        println!(
            "{}: total={} added={} updated={} deleted={}",
            s.object_type,
            s.total,
            cs.added.unwrap_or(0),
            cs.updated.unwrap_or(0),
            cs.deleted.unwrap_or(0)
        );
    }
}
