//! CLI argument parsing and command dispatch

use broker_bench_core::config::{InfrastructureConfig, TestPlan};
use broker_bench_core::error::{LabError, LabResult};
use broker_bench_core::experiment::{parse_tag_arg, ExperimentId};
use broker_bench_core::provisioner::TerraformProvisioner;
use broker_bench_core::sequencer::Sequencer;
use broker_bench_core::store::Store;
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Lifecycle driver for ephemeral messaging-cluster load-testing experiments
#[derive(Parser)]
#[command(name = "broker-bench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Experiment store root
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Region override (defaults to the config file / environment)
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Provisioner module directory
    #[arg(long, global = true, default_value = "terraform")]
    pub provisioner_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the complete lifecycle: provision, converge, test, report, teardown
    Full {
        /// Path to the test plan
        #[arg(long)]
        test_plan: PathBuf,
        /// Path to the infrastructure config
        #[arg(long, default_value = "config/infrastructure.yaml")]
        config: PathBuf,
        /// Explicit experiment id (auto-generated if omitted)
        #[arg(long)]
        experiment_id: Option<String>,
        /// Additional resource tags, KEY=VALUE (repeatable; override config tags)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Provision and converge a cluster, then leave it running
    Setup {
        /// Path to the infrastructure config
        #[arg(long)]
        config: PathBuf,
        /// Explicit experiment id (auto-generated if omitted)
        #[arg(long)]
        experiment_id: Option<String>,
        /// Additional resource tags, KEY=VALUE (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Run a test plan against an existing cluster
    Run {
        /// Path to the test plan
        #[arg(long)]
        test_plan: PathBuf,
        /// Experiment id, or `latest`
        #[arg(long)]
        experiment_id: String,
    },
    /// Rebuild the report from stored artefacts
    Report {
        /// Experiment id, or `latest`
        #[arg(long)]
        experiment_id: String,
    },
    /// Destroy every resource tagged with the experiment id
    Teardown {
        /// Experiment id, or `latest`
        #[arg(long)]
        experiment_id: String,
        /// Print the reclaim plan without destroying anything
        #[arg(long)]
        dry_run: bool,
    },
    /// List experiments in the store
    List,
}

impl Cli {
    /// Dispatch the parsed command
    pub async fn run(self) -> LabResult<()> {
        let store = Store::open(self.data_dir()?)?;

        // `list` and `report` need no cloud access
        match &self.command {
            Commands::List => return list_experiments(&store),
            Commands::Report { experiment_id } => {
                return report_only(&store, experiment_id).await;
            }
            _ => {}
        }

        let region = self.resolve_region()?;
        let backends = broker_bench_aws::connect(region).await;
        let provisioner = Arc::new(TerraformProvisioner::new(&self.provisioner_dir));

        let mut sequencer = Sequencer::new(
            backends.compute,
            backends.control,
            provisioner,
            store,
        );

        match self.command {
            Commands::Full {
                test_plan,
                config,
                experiment_id,
                tags,
            } => {
                let cfg = InfrastructureConfig::load(&config)?;
                let plan = TestPlan::load(&test_plan)?;
                sequencer = sequencer.with_tags(parse_tags(&tags)?);
                if let Some(id) = experiment_id {
                    sequencer = sequencer.with_experiment_id(ExperimentId::parse(&id)?);
                }
                let sequencer = Arc::new(sequencer);
                wire_interrupt(&sequencer);

                let id = sequencer.run_full(&cfg, &plan).await?;
                println!("experiment {id} complete; resources reclaimed");
                Ok(())
            }
            Commands::Setup {
                config,
                experiment_id,
                tags,
            } => {
                let cfg = InfrastructureConfig::load(&config)?;
                sequencer = sequencer.with_tags(parse_tags(&tags)?);
                if let Some(id) = experiment_id {
                    sequencer = sequencer.with_experiment_id(ExperimentId::parse(&id)?);
                }
                let sequencer = Arc::new(sequencer);
                wire_interrupt(&sequencer);

                let id = sequencer.setup(&cfg).await?;
                println!("experiment {id} ready; tear down with:");
                println!("  broker-bench teardown --experiment-id {id}");
                Ok(())
            }
            Commands::Run {
                test_plan,
                experiment_id,
            } => {
                let plan = TestPlan::load(&test_plan)?;
                let sequencer = Arc::new(sequencer);
                wire_interrupt(&sequencer);

                let records = sequencer.run_matrix(&plan, &experiment_id).await?;
                for record in &records {
                    println!("{:<28} {:?}", record.variant, record.status);
                }
                Ok(())
            }
            Commands::Teardown {
                experiment_id,
                dry_run,
            } => {
                if dry_run {
                    let plan = sequencer.teardown_plan(&experiment_id).await?;
                    print_reclaim_plan(&plan);
                } else {
                    sequencer.teardown(&experiment_id).await?;
                    println!("all resources reclaimed");
                }
                Ok(())
            }
            Commands::List | Commands::Report { .. } => unreachable!("handled above"),
        }
    }

    fn data_dir(&self) -> LabResult<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".broker-bench"))
            .ok_or_else(|| LabError::config("no --data-dir given and HOME is unset"))
    }

    /// Region precedence: --region flag, then the infrastructure config
    /// named on the command line, then the ambient AWS environment
    fn resolve_region(&self) -> LabResult<Option<String>> {
        if self.region.is_some() {
            return Ok(self.region.clone());
        }
        let config_path = match &self.command {
            Commands::Full { config, .. } | Commands::Setup { config, .. } => Some(config),
            _ => None,
        };
        match config_path {
            Some(path) => Ok(Some(InfrastructureConfig::load(path)?.cloud.region)),
            None => Ok(None),
        }
    }
}

fn parse_tags(args: &[String]) -> LabResult<BTreeMap<String, String>> {
    args.iter().map(|arg| parse_tag_arg(arg)).collect()
}

/// Cancel the experiment on Ctrl-C; the sequencer still drives teardown
fn wire_interrupt(sequencer: &Arc<Sequencer>) {
    let cancel = sequencer.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling experiment");
            let _ = cancel.send(true);
        }
    });
}

fn list_experiments(store: &Store) -> LabResult<()> {
    let listings = store.list()?;
    if listings.is_empty() {
        println!("no experiments found");
        return Ok(());
    }
    for listing in listings {
        let modified: DateTime<Local> = listing.modified.into();
        let marker = if listing.is_latest { " (latest)" } else { "" };
        println!(
            "{:<24} {}{}",
            listing.id,
            modified.format("%Y-%m-%d %H:%M:%S"),
            marker
        );
    }
    Ok(())
}

async fn report_only(store: &Store, experiment_id: &str) -> LabResult<()> {
    let id = store.resolve(experiment_id)?;
    let experiment = store.open_experiment(&id)?;
    let report = broker_bench_core::matrix::write_report(&experiment)?;
    println!(
        "report for {} written to {}",
        id,
        experiment.report_dir().join("report.json").display()
    );
    for entry in &report.variants {
        match &entry.summary {
            Some(summary) => println!(
                "{:<28} {:?}  publish {:.0} msg/s  p99 {:.1} ms  p99.9 {:.1} ms",
                entry.variant,
                entry.status,
                summary.publish_rate,
                summary.publish_latency.p99,
                summary.publish_latency.p999
            ),
            None => println!("{:<28} {:?}", entry.variant, entry.status),
        }
    }
    Ok(())
}

fn print_reclaim_plan(plan: &broker_bench_core::reclaim::ReclaimPlan) {
    if plan.is_empty() {
        println!("nothing tagged with this experiment id");
        return;
    }
    println!("would destroy {} resources:", plan.total());
    let kinds: [(&str, &[String]); 6] = [
        ("instance", &plan.instances),
        ("volume", &plan.volumes),
        ("security-group", &plan.security_groups),
        ("subnet", &plan.subnets),
        ("route-table", &plan.route_tables),
        ("vpc", &plan.vpcs),
    ];
    for (kind, ids) in kinds {
        for id in ids {
            println!("  {kind:<16} {id}");
        }
    }
    for gateway in &plan.internet_gateways {
        println!("  {:<16} {}", "internet-gateway", gateway.id);
    }
}
