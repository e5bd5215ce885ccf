mod cli;
mod colors;
mod config;
mod error;
mod health;
mod k8s;
mod model;
mod table;
mod watch;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{CliArgs, Command, ScopeArgs};
use colors::Palette;
use config::Settings;
use error::{NotFoundError, WatchError};
use k8s::KubeSession;
use model::{NamespaceScope, ResourceKind, ResourceRow, TableSpec};
use std::io::Write;
use std::process::ExitCode;
use table::{Screen, TerminalScreen};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use watch::{SnapshotFetcher, WatchLoop, build_table};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report_error(&error);
            ExitCode::FAILURE
        }
    }
}

const FALLBACK_LOG_FILTER: &str = "info";

/// Logs go to stderr so they never interleave with tables on stdout. An
/// unparsable filter falls back to `info` and is reported once logging is up.
fn init_tracing(directives: &str) {
    let (filter, rejected) = match EnvFilter::try_new(directives) {
        Ok(filter) => (filter, None),
        Err(error) => (EnvFilter::new(FALLBACK_LOG_FILTER), Some(error)),
    };

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();

    if installed && let Some(error) = rejected {
        warn!(%directives, "invalid log filter, using '{FALLBACK_LOG_FILTER}': {error}");
    }
}

async fn run(args: CliArgs) -> Result<()> {
    let settings = Settings::load()?;
    if let Some(source) = settings.source() {
        debug!(%source, "loaded settings");
    }

    let mut screen = TerminalScreen::stdout();
    let colored = !args.no_color && settings.colors_enabled() && screen.is_interactive();
    let palette = Palette::new(colored);

    let mut session = KubeSession::new(settings.current_context().map(str::to_string));
    if let Some(context) = args.context {
        session.use_context(context);
    }

    match args.command {
        Command::Watch { kind, scope } => {
            let signals =
                ShutdownSignals::install().context("failed to install signal handlers")?;
            let scope = resolve_scope(&scope, &settings, &session).await?;
            let mut watch = WatchLoop::new(&session, &session, &mut screen, palette);
            watch.run(&kind, scope, signals.received()).await?;
        }
        Command::Get { kind, name, scope } => {
            let resolved = ResourceKind::from_token(&kind)
                .ok_or_else(|| WatchError::unsupported(&kind, "get"))?;
            match name {
                Some(name) => {
                    if scope.all_namespaces {
                        anyhow::bail!("a resource cannot be retrieved by name across all namespaces");
                    }
                    let namespace = match explicit_scope(&scope, &settings) {
                        Some(NamespaceScope::Named(namespace)) => namespace,
                        _ => session.default_namespace().await?,
                    };
                    let row = session.get_row(resolved, &namespace, &name).await?;
                    let spec = TableSpec::for_kind(resolved, &NamespaceScope::Named(namespace));
                    print_table(&mut screen, spec, vec![row], palette)?;
                }
                None => {
                    let scope = resolve_scope(&scope, &settings, &session).await?;
                    let rows = session.fetch(resolved, &scope).await?;
                    let table = build_table(TableSpec::for_kind(resolved, &scope), rows);
                    if table.is_empty() {
                        writeln!(screen, "No resources found in {scope}.")?;
                    } else {
                        table.render(&mut screen, palette)?;
                    }
                    screen.flush()?;
                }
            }
        }
        Command::Health { namespace } => {
            health::write_node_section(&mut screen, session.node_rows().await, palette)?;
            match namespace {
                Some(namespace) => {
                    let rows = session.pod_health_rows(&namespace).await?;
                    health::write_namespace_section(&mut screen, &namespace, rows, palette)?;
                }
                None => {
                    for namespace in session.namespace_names().await? {
                        match session.pod_health_rows(&namespace).await {
                            Ok(rows) => health::write_namespace_section(
                                &mut screen,
                                &namespace,
                                rows,
                                palette,
                            )?,
                            Err(error) => {
                                warn!(%namespace, "pod health unavailable: {error:#}");
                                writeln!(screen, "Error displaying pods in {namespace}: {error:#}")?;
                            }
                        }
                    }
                }
            }
            screen.flush()?;
        }
        Command::Ns => {
            let rows = session.namespace_rows().await?;
            print_table(&mut screen, TableSpec::new(["NAME", "STATUS", "AGE"]), rows, palette)?;
        }
        Command::Ctx => {
            let rows = k8s::kube_contexts(session.selected_context())?
                .into_iter()
                .map(|entry| {
                    ResourceRow::new(vec![
                        if entry.current { "*" } else { "" }.to_string(),
                        entry.name,
                        entry.cluster,
                        entry.namespace.unwrap_or_default(),
                    ])
                })
                .collect();
            print_table(
                &mut screen,
                TableSpec::new(["CURRENT", "NAME", "CLUSTER", "NAMESPACE"]),
                rows,
                palette,
            )?;
        }
    }

    Ok(())
}

async fn resolve_scope(
    args: &ScopeArgs,
    settings: &Settings,
    session: &KubeSession,
) -> Result<NamespaceScope> {
    if let Some(scope) = explicit_scope(args, settings) {
        return Ok(scope);
    }
    Ok(NamespaceScope::Named(session.default_namespace().await?))
}

/// Scope chosen by flags or settings alone; `None` defers to the kubeconfig.
fn explicit_scope(args: &ScopeArgs, settings: &Settings) -> Option<NamespaceScope> {
    if args.all_namespaces {
        return Some(NamespaceScope::All);
    }
    args.namespace
        .as_deref()
        .or(settings.current_namespace())
        .map(|namespace| NamespaceScope::Named(namespace.to_string()))
}

fn print_table<S: Screen>(
    screen: &mut S,
    spec: TableSpec,
    rows: Vec<ResourceRow>,
    palette: Palette,
) -> Result<()> {
    build_table(spec, rows).render(screen, palette)?;
    screen.flush()?;
    Ok(())
}

/// Ctrl+C and SIGTERM handlers, registered on construction so a signal that
/// arrives before the watch starts streaming is still caught.
struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(windows)]
    ctrl_c: tokio::signal::windows::CtrlC,
}

impl ShutdownSignals {
    #[cfg(unix)]
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(windows)]
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    #[cfg(unix)]
    async fn received(mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => debug!("interrupt received"),
            _ = self.terminate.recv() => debug!("terminate received"),
        }
    }

    #[cfg(windows)]
    async fn received(mut self) {
        self.ctrl_c.recv().await;
        debug!("ctrl-c received");
    }
}

fn report_error(error: &anyhow::Error) {
    eprintln!("Error: {error}");
    if let Some(suggestion) = suggestion_for(error) {
        eprintln!("Suggestion: {suggestion}");
    }
    let details = compact_causes(error);
    if !details.is_empty() {
        eprintln!("Details: {details}");
    }
}

fn suggestion_for(error: &anyhow::Error) -> Option<String> {
    if let Some(WatchError::UnsupportedKind { .. }) = error.downcast_ref::<WatchError>() {
        return Some(format!(
            "Supported resource types: {}",
            ResourceKind::supported_list()
        ));
    }
    if let Some(not_found) = error.downcast_ref::<NotFoundError>() {
        return Some(format!(
            "Check the name, or list them with 'kview get {} -n {}'",
            not_found.kind, not_found.namespace
        ));
    }

    let text = format!("{error:#}").to_ascii_lowercase();
    if text.contains("connection refused")
        || text.contains("no such host")
        || text.contains("kubeconfig")
        || text.contains("dns error")
    {
        return Some(
            "Cannot reach the cluster. Check your kubeconfig and the selected context".to_string(),
        );
    }
    if text.contains("401") || text.contains("unauthorized") {
        return Some("Authentication failed. Your credentials may have expired".to_string());
    }
    if text.contains("403") || text.contains("forbidden") {
        return Some("Access denied. Check your permissions for this resource".to_string());
    }
    if text.contains("404") {
        return Some("The requested API resource was not found on this cluster".to_string());
    }
    None
}

fn compact_causes(error: &anyhow::Error) -> String {
    error
        .chain()
        .skip(1)
        .take(3)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use super::{ShutdownSignals, compact_causes, explicit_scope, suggestion_for};
    use crate::cli::ScopeArgs;
    use crate::config::Settings;
    use crate::error::{NotFoundError, WatchError};
    use crate::model::NamespaceScope;
    use anyhow::{Context, anyhow};

    #[test]
    fn all_namespaces_wins() {
        let args = ScopeArgs {
            namespace: None,
            all_namespaces: true,
        };
        let settings = Settings::from_yaml("current_namespace: dev").unwrap();
        assert_eq!(explicit_scope(&args, &settings), Some(NamespaceScope::All));
    }

    #[test]
    fn flag_then_settings_then_kubeconfig() {
        let settings = Settings::from_yaml("current_namespace: dev").unwrap();
        let flagged = ScopeArgs {
            namespace: Some("prod".to_string()),
            all_namespaces: false,
        };
        assert_eq!(
            explicit_scope(&flagged, &settings),
            Some(NamespaceScope::Named("prod".to_string()))
        );
        assert_eq!(
            explicit_scope(&ScopeArgs::default(), &settings),
            Some(NamespaceScope::Named("dev".to_string()))
        );
        assert_eq!(
            explicit_scope(&ScopeArgs::default(), &Settings::default()),
            None
        );
    }

    #[test]
    fn unsupported_kind_lists_supported_types() {
        let error = anyhow::Error::new(WatchError::unsupported("nodes", "watch"));
        let suggestion = suggestion_for(&error).unwrap();
        assert!(suggestion.contains("pods"));
        assert!(suggestion.contains("serviceaccounts"));
    }

    #[test]
    fn not_found_points_to_listing() {
        let error = anyhow::Error::new(NotFoundError {
            kind: "pod",
            name: "web".to_string(),
            namespace: "default".to_string(),
        });
        assert_eq!(
            error.to_string(),
            "Resource 'pod/web' not found in namespace 'default'"
        );
        assert!(suggestion_for(&error).unwrap().contains("kview get pod -n default"));
    }

    #[test]
    fn connection_and_permission_failures() {
        let refused = Err::<(), _>(anyhow!("tcp connect error: Connection refused"))
            .context("failed to list pods")
            .unwrap_err();
        assert!(suggestion_for(&refused).unwrap().contains("kubeconfig"));

        let forbidden = anyhow!("pods is forbidden: User cannot list resource");
        assert!(suggestion_for(&forbidden).unwrap().contains("permissions"));

        assert_eq!(suggestion_for(&anyhow!("something odd")), None);
    }

    #[test]
    fn details_skip_top_level_message() {
        let error = Err::<(), _>(anyhow!("root cause"))
            .context("middle")
            .context("top")
            .unwrap_err();
        assert_eq!(compact_causes(&error), "middle: root cause");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupt_before_streaming_is_caught() {
        let signals = ShutdownSignals::install().unwrap();
        let status = std::process::Command::new("kill")
            .args(["-INT", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(std::time::Duration::from_secs(5), signals.received())
            .await
            .expect("interrupt delivered to the installed handler");
    }
}
