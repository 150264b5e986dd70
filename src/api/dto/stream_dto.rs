use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct NamespaceQuery {
    /// Empty or absent means all namespaces.
    pub namespace: Option<String>,
}
