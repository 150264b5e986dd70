// Kube-rs based Kubernetes client
pub mod context_registry;
pub mod kube_client;
pub mod kube_resources;
pub mod kubeconfig;
pub mod mappers;
pub mod pods;
pub mod resource_kinds;
pub mod watchers;
