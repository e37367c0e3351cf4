mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;

use kubemux_engine::{
    Connection, FeedSnapshot, FilterEvent, LogEngine, LogTarget, ParsedLogLine, SessionEvent,
    SshEndpoint, StreamOptions,
};

/// Kubemux - multiplexed, filterable log streams from Kubernetes containers
#[derive(Parser, Debug)]
#[command(name = "kubemux")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace (optional, lists namespaces if not provided)
    #[arg(value_name = "NAMESPACE")]
    namespace: Option<String>,

    /// Pod name (optional, lists pods if not provided)
    #[arg(value_name = "POD")]
    pod: Option<String>,

    /// Container name (optional, lists containers if not provided)
    #[arg(value_name = "CONTAINER")]
    container: Option<String>,

    /// Path to the kubeconfig file
    #[arg(long, value_name = "PATH")]
    kubeconfig: Option<PathBuf>,

    /// SSH bastion host; the API server is reached through a tunnel
    #[arg(long, value_name = "HOST")]
    ssh_host: Option<String>,

    /// SSH port on the bastion
    #[arg(long, default_value = "22", value_name = "PORT")]
    ssh_port: u16,

    /// SSH username (required with --ssh-host)
    #[arg(long, value_name = "USER", requires = "ssh_host")]
    ssh_user: Option<String>,

    /// Path to the SSH private key (required with --ssh-host)
    #[arg(long, value_name = "PATH", requires = "ssh_host")]
    ssh_key: Option<PathBuf>,

    /// Keep the stream open and follow new log lines
    #[arg(short, long)]
    follow: bool,

    /// Number of historical log lines to fetch
    #[arg(long, value_name = "N")]
    tail: Option<i64>,

    /// Only return logs newer than this RFC 3339 timestamp
    #[arg(long, value_name = "TIMESTAMP")]
    since: Option<String>,

    /// Pattern pipeline applied in-process, e.g. 'grep "error" | grep -v debug'
    #[arg(long, value_name = "EXPR")]
    filter: Option<String>,

    /// External filter command run in the sandbox, e.g. 'grep error | cut -d" " -f2-'
    #[arg(long, value_name = "CMD")]
    shell_filter: Option<String>,

    /// Ring buffer capacity per session
    #[arg(long, value_name = "N")]
    buffer_size: Option<usize>,

    /// Path to the config file (default: ~/.config/kubemux/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing for debugging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run_app(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run_app(args: Args) -> Result<()> {
    let mut engine_config = config::load_engine_config(args.config.as_deref())?;
    if let Some(capacity) = args.buffer_size {
        engine_config.buffer_capacity = capacity;
    }

    let kubeconfig_path = args
        .kubeconfig
        .clone()
        .or_else(default_kubeconfig_path)
        .context("No kubeconfig given and no default found; pass --kubeconfig")?;
    let kubeconfig = std::fs::read_to_string(&kubeconfig_path).context(format!(
        "Failed to read kubeconfig: {}",
        kubeconfig_path.display()
    ))?;

    let mut connection = Connection::new(
        "default".to_string(),
        kubeconfig_path.display().to_string(),
        kubeconfig,
    );
    if let Some(host) = &args.ssh_host {
        // clap enforces user and key alongside --ssh-host
        let user = args.ssh_user.clone().context("--ssh-user is required")?;
        let key = args.ssh_key.clone().context("--ssh-key is required")?;
        connection = connection.with_ssh(SshEndpoint::new(
            host.clone(),
            args.ssh_port,
            user,
            key.display().to_string(),
        ));
    }

    let engine = LogEngine::new(engine_config);
    engine
        .add_connection(connection)
        .await
        .context("Failed to connect to cluster")?;
    let cluster = engine.cluster("default")?;

    // Drill down: missing coordinate parts fall back to listing
    let Some(namespace) = &args.namespace else {
        let namespaces = cluster.list_namespaces().await?;
        for name in namespaces {
            println!("{}", name);
        }
        return Ok(());
    };

    let Some(pod) = &args.pod else {
        let pods = cluster.list_pods(namespace).await?;
        if pods.is_empty() {
            anyhow::bail!("No pods found in namespace '{}'", namespace);
        }
        for pod in pods {
            println!("{}\t{}\t{}", pod.name, pod.phase, pod.containers.join(","));
        }
        return Ok(());
    };

    let Some(container) = &args.container else {
        let containers = cluster.list_containers(namespace, pod).await?;
        if containers.is_empty() {
            anyhow::bail!("Pod '{}/{}' has no containers", namespace, pod);
        }
        for name in containers {
            println!("{}", name);
        }
        return Ok(());
    };

    let since_time = args
        .since
        .as_deref()
        .map(parse_since)
        .transpose()
        .context("Invalid --since timestamp, expected RFC 3339")?;

    let target = LogTarget::new(namespace.clone(), pod.clone(), container.clone());
    let session_id = target.to_string();
    let options = StreamOptions {
        follow: args.follow,
        since_time,
        tail_lines: args.tail,
    };

    let mut session_events = engine.subscribe_session_events(&session_id);
    let mut revisions = engine.feed().subscribe(&session_id);

    engine.start_log_stream(&session_id, "default", target, options)?;

    if let Some(expression) = &args.filter {
        engine.set_filter_expression(&session_id, expression);
    }
    if let Some(command) = &args.shell_filter {
        engine.start_shell_filter(&session_id, command)?;
    }
    let mut filter_events = engine.subscribe_filter_events(&session_id);

    // Print whatever lands in the feed until the stream closes
    let mut printed: Option<Arc<ParsedLogLine>> = None;
    loop {
        tokio::select! {
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                print_new_lines(&engine.snapshot(&session_id), &mut printed);
            }

            Some(event) = session_events.recv() => {
                match event {
                    SessionEvent::Data { .. } => {}
                    SessionEvent::Error { message, .. } => {
                        eprintln!("stream error: {}", message);
                        break;
                    }
                    SessionEvent::Closed { .. } => {
                        print_new_lines(&engine.snapshot(&session_id), &mut printed);
                        break;
                    }
                }
            }

            Some(event) = filter_events.recv() => {
                match event {
                    FilterEvent::Data { .. } => {}
                    FilterEvent::Diagnostic { message, .. } => {
                        eprintln!("filter: {}", message);
                    }
                    FilterEvent::Exited { code, .. } => {
                        eprintln!("filter exited with code {:?}", code);
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    engine.stop_log_stream(&session_id);
    engine.stop_all();
    Ok(())
}

/// Print lines added to the feed since the last call.
///
/// The snapshot's visible lines are an append-only sequence between
/// flushes (modulo eviction and filter changes), so the last printed
/// line's position marks where to resume. If it is gone the view was
/// rebuilt and we print the whole snapshot again.
fn print_new_lines(snapshot: &FeedSnapshot, printed: &mut Option<Arc<ParsedLogLine>>) {
    let start = printed
        .as_ref()
        .and_then(|last| {
            snapshot
                .lines
                .iter()
                .rposition(|line| Arc::ptr_eq(line, last))
        })
        .map(|idx| idx + 1)
        .unwrap_or(0);

    for line in &snapshot.lines[start..] {
        println!("{}", line.raw);
    }

    *printed = snapshot.lines.last().cloned();
}

fn default_kubeconfig_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("KUBECONFIG") {
        return Some(PathBuf::from(path));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kube").join("config"))
}

fn parse_since(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)?;
    Ok(parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_since_accepts_rfc3339() {
        let ts = parse_since("2024-06-01T12:00:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-06-01T12:00:00+00:00");
        assert!(parse_since("yesterday").is_err());
    }

    #[test]
    fn test_print_new_lines_resumes_after_last_printed() {
        let a = Arc::new(kubemux_engine::classify("line a"));
        let b = Arc::new(kubemux_engine::classify("line b"));

        let snapshot = FeedSnapshot {
            lines: vec![Arc::clone(&a), Arc::clone(&b)],
            revision: 1,
            follow: true,
            external: false,
        };

        let mut printed = Some(Arc::clone(&a));
        print_new_lines(&snapshot, &mut printed);
        assert!(Arc::ptr_eq(printed.as_ref().unwrap(), &b));

        // Last printed line evicted: the whole snapshot is reprinted
        let mut printed = Some(Arc::new(kubemux_engine::classify("gone")));
        print_new_lines(&snapshot, &mut printed);
        assert!(Arc::ptr_eq(printed.as_ref().unwrap(), &b));
    }
}
