use clap::{Args, Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "kview",
    version,
    about = "Colorized tables and live watches for Kubernetes resources."
)]
pub struct CliArgs {
    /// Kubeconfig context to use instead of the current one
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, global = true, default_value = "warn")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Render a resource table and re-render it on every change
    Watch {
        /// Resource type or shortcut (po, deploy, svc, cm, sec, ing, sa)
        kind: String,

        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Render a resource table once
    Get {
        /// Resource type or shortcut (po, deploy, svc, cm, sec, ing, sa)
        kind: String,

        /// Show a single named resource
        name: Option<String>,

        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Show node status and pod health per namespace
    Health {
        /// Limit pod health to one namespace (all namespaces by default)
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// List namespaces
    #[command(alias = "namespaces")]
    Ns,

    /// List kubeconfig contexts
    #[command(alias = "contexts")]
    Ctx,
}

#[derive(Debug, Clone, Default, Args)]
pub struct ScopeArgs {
    /// Namespace to use
    #[arg(short, long, conflicts_with = "all_namespaces")]
    pub namespace: Option<String>,

    /// Use all namespaces
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,
}
