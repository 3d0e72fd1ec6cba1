//! kubectl-agones-egress: A kubectl plugin for inspecting generated egress gateway policies
//!
//! - `kubectl agones-egress list` - List managed CiliumEgressGatewayPolicies
//! - `kubectl agones-egress check [policy-name]` - Dry-run the consistency check

use std::process;

use clap::{Parser, Subcommand};
use kube::{Client, ResourceExt};
use serde::Serialize;

use agones_lb_operator::controller::egress_policy::{back_references, check};
use agones_lb_operator::crd::keys::{ContractKey, HOSTNAME_LABEL, TRUE};
use agones_lb_operator::crd::CiliumEgressGatewayPolicy;
use agones_lb_operator::error::{Error, Result};
use agones_lb_operator::store::{KubeStore, LabelSelector, ResourceStore};

#[derive(Parser)]
#[command(name = "kubectl-agones-egress")]
#[command(about = "A kubectl plugin for Agones egress gateway policies", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (table, json, yaml)
    #[arg(short, long, global = true, default_value = "table")]
    output: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List managed CiliumEgressGatewayPolicy resources
    List,
    /// Evaluate managed policies against their GameServer and Service without deleting anything
    Check {
        /// Name of a specific policy (optional, checks all if omitted)
        policy_name: Option<String>,
    },
}

/// One managed policy as shown by `list`
#[derive(Serialize)]
struct PolicyRow {
    name: String,
    egress_ip: String,
    node: String,
    game_server: String,
    service: String,
}

/// Verdict for one policy as shown by `check`
#[derive(Serialize)]
struct CheckRow {
    name: String,
    verdict: String,
    would_delete: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = Client::try_default().await.map_err(Error::KubeError)?;
    let store = KubeStore::new(client);

    match cli.command {
        Commands::List => list_policies(&store, &cli.output).await,
        Commands::Check { policy_name } => check_policies(&store, policy_name.as_deref(), &cli.output).await,
    }
}

async fn managed_policies(store: &KubeStore) -> Result<Vec<CiliumEgressGatewayPolicy>> {
    let selector = LabelSelector::new().equals(ContractKey::IsManaged.key(), TRUE);
    store.list(None, &selector).await
}

fn reference_or_dash(reference: std::result::Result<String, ContractKey>) -> String {
    reference.unwrap_or_else(|_| "-".to_string())
}

fn policy_row(policy: &CiliumEgressGatewayPolicy) -> PolicyRow {
    let gateway = &policy.spec.egress_gateway;
    PolicyRow {
        name: policy.name_any(),
        egress_ip: gateway.egress_ip.clone().unwrap_or_else(|| "-".to_string()),
        node: gateway
            .node_selector
            .match_labels
            .get(HOSTNAME_LABEL)
            .cloned()
            .unwrap_or_else(|| "-".to_string()),
        game_server: reference_or_dash(policy.game_server_ref().map(|r| r.to_string())),
        service: reference_or_dash(policy.service_ref().map(|r| r.to_string())),
    }
}

/// Helper function to format rows as JSON or YAML
fn format_structured<T: Serialize>(rows: &[T], output: &str) -> Result<String> {
    match output {
        "yaml" => serde_yaml::to_string(rows)
            .map_err(|e| Error::ConfigError(format!("YAML serialization error: {}", e))),
        _ => serde_json::to_string_pretty(rows)
            .map_err(|e| Error::ConfigError(format!("JSON serialization error: {}", e))),
    }
}

/// Helper function to format policy list as table
fn format_policies_table(rows: &[PolicyRow]) {
    println!(
        "{:<45} {:<16} {:<30} {:<30} {:<40}",
        "NAME", "EGRESS IP", "NODE", "GAMESERVER", "SERVICE"
    );
    println!("{}", "-".repeat(165));
    for row in rows {
        println!(
            "{:<45} {:<16} {:<30} {:<30} {:<40}",
            row.name, row.egress_ip, row.node, row.game_server, row.service
        );
    }
}

/// List managed policies
async fn list_policies(store: &KubeStore, output: &str) -> Result<()> {
    let rows: Vec<PolicyRow> = managed_policies(store).await?.iter().map(policy_row).collect();

    match output {
        "json" | "yaml" => println!("{}", format_structured(&rows, output)?),
        _ => format_policies_table(&rows),
    }
    Ok(())
}

/// Run the consistency evaluation for one or all managed policies
async fn check_policies(store: &KubeStore, policy_name: Option<&str>, output: &str) -> Result<()> {
    let policies = match policy_name {
        Some(name) => {
            let policy: Option<CiliumEgressGatewayPolicy> = store.get(None, name).await?;
            let policy = policy.ok_or_else(|| {
                Error::ConfigError(format!("CiliumEgressGatewayPolicy {} not found", name))
            })?;
            if !policy.is_managed() {
                return Err(Error::ConfigError(format!(
                    "CiliumEgressGatewayPolicy {} is not managed by the operator",
                    name
                )));
            }
            vec![policy]
        }
        None => managed_policies(store).await?,
    };

    let mut rows = Vec::with_capacity(policies.len());
    for policy in &policies {
        let row = match back_references(policy) {
            Ok((gs_ref, svc_ref)) => {
                let verdict = check(store, &gs_ref, &svc_ref).await?;
                CheckRow {
                    name: policy.name_any(),
                    would_delete: !verdict.is_consistent(),
                    verdict: verdict.to_string(),
                }
            }
            Err(e) => CheckRow {
                name: policy.name_any(),
                verdict: format!("skipped: {}", e),
                would_delete: false,
            },
        };
        rows.push(row);
    }

    match output {
        "json" | "yaml" => println!("{}", format_structured(&rows, output)?),
        _ => {
            println!("{:<45} {:<14} {}", "NAME", "WOULD DELETE", "VERDICT");
            println!("{}", "-".repeat(100));
            for row in &rows {
                println!("{:<45} {:<14} {}", row.name, row.would_delete, row.verdict);
            }
        }
    }
    Ok(())
}
