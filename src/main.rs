use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use fog_node::api::config_dto::{NodeDto, NodeSpecsDto};
use fog_node::api::OrchestratorApi;
use fog_node::domain::CoS;
use fog_node::net::udp::UdpWire;
use fog_node::persistence::CsvStore;
use fog_node::resources::{Measures, SimExecutor, StaticSource};
use fog_node::{logger, Engine, Settings};

/// Joins this node to an orchestrated topology, as a pure consumer of
/// remote resources or as a resource offering its own.
#[derive(Parser)]
#[command(name = "fog_node")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Connect as client: request resources, offer none.
    Client {
        /// Server IP and API port. Format is IP:PORT.
        #[arg(short, long)]
        server: String,
        /// Custom node ID (for simulations).
        #[arg(short, long)]
        id: Option<String>,
        /// Custom node label (for simulations).
        #[arg(short, long)]
        label: Option<String>,
        /// Detailed output on the console.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Connect as resource: client mode plus offering local resources.
    Resource {
        /// Server IP and API port. Format is IP:PORT.
        #[arg(short, long)]
        server: String,
        /// Custom node ID (for simulations).
        #[arg(short, long)]
        id: Option<String>,
        /// Custom node label (for simulations).
        #[arg(short, long)]
        label: Option<String>,
        /// Resource usage limit percentage (%).
        #[arg(short = 'm', long)]
        limit: Option<f64>,
        /// Number of simulated CPUs.
        #[arg(short, long)]
        cpu: Option<f64>,
        /// Size of simulated RAM (in MB).
        #[arg(short, long)]
        ram: Option<f64>,
        /// Size of simulated disk (in GB).
        #[arg(short = 'd', long)]
        disk: Option<f64>,
        /// Detailed output on the console.
        #[arg(short, long)]
        verbose: bool,
    },
}

impl Mode {
    fn server(&self) -> &str {
        match self {
            Mode::Client { server, .. } | Mode::Resource { server, .. } => server,
        }
    }

    fn verbose(&self) -> bool {
        match self {
            Mode::Client { verbose, .. } | Mode::Resource { verbose, .. } => *verbose,
        }
    }

    /// CLI options override the environment and the received configuration.
    fn overlay(&self, params: &mut HashMap<String, String>) {
        match self {
            Mode::Client { .. } => {
                params.insert("IS_RESOURCE".into(), "False".into());
            }
            Mode::Resource { limit, cpu, ram, disk, .. } => {
                params.insert("IS_RESOURCE".into(), "True".into());
                if let Some(limit) = limit {
                    params.insert("LIMIT".into(), limit.to_string());
                }
                if let Some(cpu) = cpu {
                    params.insert("HOST_CPU".into(), cpu.to_string());
                }
                if let Some(ram) = ram {
                    params.insert("HOST_RAM".into(), ram.to_string());
                }
                if let Some(disk) = disk {
                    params.insert("HOST_DISK".into(), disk.to_string());
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logger::init(cli.mode.verbose());

    let (server_ip, api_port) = parse_server(cli.mode.server())?;
    let api = OrchestratorApi::new(&server_ip, api_port);

    let config = api
        .get_config()
        .await
        .context("Could not fetch configuration from the orchestrator")?;

    let mut params = config.parameters;
    cli.mode.overlay(&mut params);
    let settings = Settings::resolve(&params)?;

    let mut catalogue: Vec<CoS> = config.cos.into_iter().map(CoS::from).collect();
    if catalogue.is_empty() {
        catalogue.push(CoS::best_effort());
    }

    let wire = Arc::new(UdpWire::bind("0.0.0.0", settings.proto_port).await?);
    let executor = Arc::new(SimExecutor::new(settings.exec_min, settings.exec_max));
    let store = Arc::new(CsvStore::open(Path::new("data"), &settings.node_ip)?);
    let source = Arc::new(StaticSource(Measures {
        cpu_count: settings.host_cpu,
        cpu_free: settings.host_cpu,
        memory_total: settings.host_ram,
        memory_free: settings.host_ram,
        disk_total: settings.host_disk,
        disk_free: settings.host_disk,
    }));

    let node_id = match &cli.mode {
        Mode::Client { id, .. } | Mode::Resource { id, .. } => {
            id.clone().unwrap_or_else(|| settings.node_ip.clone())
        }
    };
    let label = match &cli.mode {
        Mode::Client { label, .. } | Mode::Resource { label, .. } => {
            label.clone().unwrap_or_else(|| node_id.clone())
        }
    };

    let engine = Engine::start(settings.clone(), catalogue, wire, executor, store, source);

    api.add_node(&NodeDto {
        id: node_id.clone(),
        label,
        mode: if settings.is_resource { "resource".into() } else { "client".into() },
        ip: settings.node_ip.clone(),
        mac: settings.node_mac.clone(),
    })
    .await
    .context("Could not register the node with the orchestrator")?;

    if settings.is_resource {
        api.update_node_specs(
            &node_id,
            &NodeSpecsDto {
                cpu: settings.host_cpu,
                ram: settings.host_ram,
                disk: settings.host_disk,
            },
        )
        .await?;
        engine.log_resources();
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, disconnecting");
        }
        result = repl(&engine) => {
            result?;
        }
    }

    api.delete_node(&node_id).await.ok();
    engine.shutdown().await;
    Ok(())
}

fn parse_server(server: &str) -> anyhow::Result<(String, u16)> {
    let Some((ip, port)) = server.split_once(':') else {
        bail!("Server format must be IP:PORT");
    };
    let ip: std::net::Ipv4Addr = ip.parse().context("Server format must be IP:PORT")?;
    let port: u16 = port.parse().context("Server format must be IP:PORT")?;
    Ok((ip.to_string(), port))
}

/// Minimal interactive loop for test-sending hosting requests.
async fn repl(engine: &Engine) -> anyhow::Result<()> {
    let mut catalogue = engine.cos_catalogue();
    catalogue.sort_by_key(|cos| cos.id);
    println!("Available Classes of Service:");
    for cos in &catalogue {
        println!("  {}: {}", cos.id, cos.name);
    }
    println!("Commands: send <cos_id> <payload>, resources, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("send") => {
                let Some(cos_id) = words.next().and_then(|w| w.parse::<u32>().ok()) else {
                    println!("Usage: send <cos_id> <payload>");
                    continue;
                };
                let payload = words.collect::<Vec<_>>().join(" ");
                match engine.send_request(cos_id, Bytes::from(payload)).await {
                    Ok(Some(result)) => {
                        println!("Result: {}", String::from_utf8_lossy(&result));
                    }
                    Ok(None) => println!("Request failed: no result"),
                    Err(e) => println!("Request error: {}", e),
                }
            }
            Some("resources") => engine.log_resources(),
            Some("quit") | Some("exit") => break,
            Some(other) => println!("Unknown command '{}'", other),
            None => {}
        }
    }
    Ok(())
}
