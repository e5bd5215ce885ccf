use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ResourceKind {
    Pods,
    Deployments,
    Services,
    ConfigMaps,
    Secrets,
    Ingresses,
    ServiceAccounts,
}

impl ResourceKind {
    pub const ALL: [Self; 7] = [
        Self::Pods,
        Self::Deployments,
        Self::Services,
        Self::ConfigMaps,
        Self::Secrets,
        Self::Ingresses,
        Self::ServiceAccounts,
    ];

    /// Canonical plural name, as used on the command line and in messages.
    pub fn plural(self) -> &'static str {
        match self {
            Self::Pods => "pods",
            Self::Deployments => "deployments",
            Self::Services => "services",
            Self::ConfigMaps => "configmaps",
            Self::Secrets => "secrets",
            Self::Ingresses => "ingresses",
            Self::ServiceAccounts => "serviceaccounts",
        }
    }

    pub fn singular(self) -> &'static str {
        match self {
            Self::Pods => "pod",
            Self::Deployments => "deployment",
            Self::Services => "service",
            Self::ConfigMaps => "configmap",
            Self::Secrets => "secret",
            Self::Ingresses => "ingress",
            Self::ServiceAccounts => "serviceaccount",
        }
    }

    /// Expands shortcuts and singular forms to a kind. Unknown tokens yield `None`.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "po" | "pod" | "pods" => Some(Self::Pods),
            "deploy" | "deployment" | "deployments" => Some(Self::Deployments),
            "svc" | "service" | "services" => Some(Self::Services),
            "cm" | "configmap" | "configmaps" => Some(Self::ConfigMaps),
            "sec" | "secret" | "secrets" => Some(Self::Secrets),
            "ing" | "ingress" | "ingresses" => Some(Self::Ingresses),
            "sa" | "serviceaccount" | "serviceaccounts" => Some(Self::ServiceAccounts),
            _ => None,
        }
    }

    /// Column headers for one namespace. All-namespaces mode prepends NAMESPACE.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Pods => &["NAME", "READY", "STATUS", "RESTARTS", "AGE"],
            Self::Deployments => &["NAME", "READY", "UP-TO-DATE", "AVAILABLE", "AGE"],
            Self::Services => &[
                "NAME",
                "TYPE",
                "CLUSTER-IP",
                "EXTERNAL-IP",
                "PORT(S)",
                "AGE",
            ],
            Self::ConfigMaps => &["NAME", "DATA", "AGE"],
            Self::Secrets => &["NAME", "TYPE", "DATA", "AGE"],
            Self::Ingresses => &["NAME", "CLASS", "HOSTS", "ADDRESS", "PORTS", "AGE"],
            Self::ServiceAccounts => &["NAME", "SECRETS", "AGE"],
        }
    }

    pub fn supported_list() -> String {
        Self::ALL
            .iter()
            .map(|kind| kind.plural())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.plural())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NamespaceScope {
    All,
    Named(String),
}

impl NamespaceScope {
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    pub fn label(&self) -> &str {
        match self {
            Self::All => "all",
            Self::Named(namespace) => namespace,
        }
    }
}

impl Display for NamespaceScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all namespaces"),
            Self::Named(namespace) => write!(f, "namespace '{namespace}'"),
        }
    }
}

/// Ordered column headers of a rendered table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TableSpec {
    headers: Vec<String>,
}

impl TableSpec {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn for_kind(kind: ResourceKind, scope: &NamespaceScope) -> Self {
        let namespace = scope.is_all().then_some("NAMESPACE");
        Self::new(namespace.into_iter().chain(kind.columns().iter().copied()))
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }
}

/// One resource instance as display cells, in column order.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ResourceRow {
    cells: Vec<String>,
}

impl ResourceRow {
    pub fn new(cells: Vec<String>) -> Self {
        Self { cells }
    }

    /// Builds a row for `scope`, putting the namespace first when listing all namespaces.
    pub fn scoped(scope: &NamespaceScope, namespace: Option<String>, cells: Vec<String>) -> Self {
        if scope.is_all() {
            let mut scoped = Vec::with_capacity(cells.len() + 1);
            scoped.push(namespace.unwrap_or_else(|| "-".to_string()));
            scoped.extend(cells);
            Self { cells: scoped }
        } else {
            Self { cells }
        }
    }

    pub fn cells(&self) -> &[String] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ObjectRef {
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectRef {
    pub fn new(name: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            name: name.into(),
            namespace,
        }
    }
}

/// A single change observed on a watched collection.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChangeEvent {
    Added(ObjectRef),
    Modified(ObjectRef),
    Deleted(ObjectRef),
}

impl ChangeEvent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Added(_) => "ADDED",
            Self::Modified(_) => "MODIFIED",
            Self::Deleted(_) => "DELETED",
        }
    }

    pub fn object(&self) -> &ObjectRef {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => object,
        }
    }

    pub fn annotation(&self) -> String {
        format!("Event: {} - {}", self.label(), self.object().name)
    }
}
