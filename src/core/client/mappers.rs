/// Maps kube-rs / k8s-openapi types → lightweight `ResourceRecord` projections
use chrono::{DateTime, Utc};

use crate::core::client::kube_resources::{
    CronJob, DaemonSet, Deployment, Job, Namespace, Node, ObjectMeta, PersistentVolume,
    PersistentVolumeClaim, Pod, ReplicaSet, Service, StatefulSet,
};
use crate::core::state::runtime::k8s::resource_snapshot::{Health, ObjectKey, ResourceRecord};

/// Container waiting reasons that will not resolve on their own.
const FATAL_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

/// Identity of an object straight from its metadata.
pub fn object_key(meta: &ObjectMeta) -> ObjectKey {
    ObjectKey::new(meta.namespace.clone(), meta.name.clone().unwrap_or_default())
}

/// Parse the creation timestamp through its RFC3339 wire form.
fn created_at(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    let ts = meta.creation_timestamp.as_ref()?;
    let value = serde_json::to_value(ts).ok()?;
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn base_record(meta: &ObjectMeta, status: impl Into<String>, health: Health) -> ResourceRecord {
    let mut record = ResourceRecord::new(
        meta.namespace.clone(),
        meta.name.clone().unwrap_or_default(),
        status,
        health,
    );
    record.created_at = created_at(meta);
    record
}

/// Ready/desired replica rule shared by every workload controller.
fn replica_health(ready: i32, desired: i32) -> Health {
    if ready >= desired {
        Health::Healthy
    } else if ready == 0 {
        Health::Error
    } else {
        Health::Warning
    }
}

// ==================== Pods ====================

pub fn project_pod(pod: &Pod) -> ResourceRecord {
    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let container_statuses = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|v| v.as_slice())
        .unwrap_or_default();

    let total = pod
        .spec
        .as_ref()
        .map(|s| s.containers.len())
        .unwrap_or(container_statuses.len());
    let ready = container_statuses.iter().filter(|c| c.ready).count();
    let restarts: i32 = container_statuses.iter().map(|c| c.restart_count).sum();

    let waiting_reason = container_statuses.iter().find_map(|c| {
        c.state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.clone())
    });
    let fatal_reason = waiting_reason
        .as_deref()
        .filter(|r| FATAL_WAITING_REASONS.contains(r));

    let (label, health) = if pod.metadata.deletion_timestamp.is_some() {
        ("Terminating".to_string(), Health::Warning)
    } else if let Some(reason) = fatal_reason {
        (reason.to_string(), Health::Error)
    } else {
        match phase.as_str() {
            "Failed" => (phase.clone(), Health::Error),
            "Succeeded" => ("Completed".to_string(), Health::Healthy),
            "Running" if ready == total => (phase.clone(), Health::Healthy),
            "Running" => (phase.clone(), Health::Warning),
            "Pending" => (
                waiting_reason.clone().unwrap_or_else(|| phase.clone()),
                Health::Warning,
            ),
            _ => (phase.clone(), Health::Warning),
        }
    };

    let mut record = base_record(&pod.metadata, label, health)
        .with_detail("ready", format!("{}/{}", ready, total))
        .with_detail("restarts", restarts.to_string());

    if let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
        record = record.with_detail("node", node);
    }
    record
}

// ==================== Workloads ====================

pub fn project_deployment(deployment: &Deployment) -> ResourceRecord {
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let status = deployment.status.as_ref();
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let available = status.and_then(|s| s.available_replicas).unwrap_or(0);
    let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);

    base_record(
        &deployment.metadata,
        format!("{}/{} ready", ready, desired),
        replica_health(ready, desired),
    )
    .with_detail("ready", format!("{}/{}", ready, desired))
    .with_detail("available", available.to_string())
    .with_detail("upToDate", updated.to_string())
}

pub fn project_statefulset(sts: &StatefulSet) -> ResourceRecord {
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);

    base_record(
        &sts.metadata,
        format!("{}/{} ready", ready, desired),
        replica_health(ready, desired),
    )
    .with_detail("ready", format!("{}/{}", ready, desired))
}

pub fn project_daemonset(ds: &DaemonSet) -> ResourceRecord {
    let (desired, ready) = ds
        .status
        .as_ref()
        .map(|s| (s.desired_number_scheduled, s.number_ready))
        .unwrap_or((0, 0));

    base_record(
        &ds.metadata,
        format!("{}/{} ready", ready, desired),
        replica_health(ready, desired),
    )
    .with_detail("desired", desired.to_string())
    .with_detail("ready", ready.to_string())
}

pub fn project_replicaset(rs: &ReplicaSet) -> ResourceRecord {
    let desired = rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = rs.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);

    base_record(
        &rs.metadata,
        format!("{}/{} ready", ready, desired),
        replica_health(ready, desired),
    )
    .with_detail("ready", format!("{}/{}", ready, desired))
}

pub fn project_job(job: &Job) -> ResourceRecord {
    let status = job.status.as_ref();
    let completions = job.spec.as_ref().and_then(|s| s.completions).unwrap_or(1);
    let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
    let active = status.and_then(|s| s.active).unwrap_or(0);

    let condition = |kind: &str| {
        status
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| conds.iter().any(|c| c.type_ == kind && c.status == "True"))
            .unwrap_or(false)
    };

    let (label, health) = if condition("Failed") {
        ("Failed", Health::Error)
    } else if condition("Complete") || succeeded >= completions {
        ("Complete", Health::Healthy)
    } else if active > 0 {
        ("Running", Health::Healthy)
    } else {
        ("Pending", Health::Warning)
    };

    base_record(&job.metadata, label, health)
        .with_detail("completions", format!("{}/{}", succeeded, completions))
}

pub fn project_cronjob(cron: &CronJob) -> ResourceRecord {
    let spec = cron.spec.as_ref();
    let suspended = spec.and_then(|s| s.suspend).unwrap_or(false);
    let active = cron
        .status
        .as_ref()
        .and_then(|s| s.active.as_ref())
        .map(|a| a.len())
        .unwrap_or(0);

    let (label, health) = if suspended {
        ("Suspended", Health::Warning)
    } else {
        ("Scheduled", Health::Healthy)
    };

    base_record(&cron.metadata, label, health)
        .with_detail("schedule", spec.map(|s| s.schedule.clone()).unwrap_or_default())
        .with_detail("active", active.to_string())
}

// ==================== Networking / cluster ====================

pub fn project_service(svc: &Service) -> ResourceRecord {
    let spec = svc.spec.as_ref();
    let svc_type = spec
        .and_then(|s| s.type_.clone())
        .unwrap_or_else(|| "ClusterIP".to_string());
    let has_ingress = svc
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|i| !i.is_empty())
        .unwrap_or(false);

    let health = if svc_type == "LoadBalancer" && !has_ingress {
        Health::Warning
    } else {
        Health::Healthy
    };
    let label = if health == Health::Warning { "Pending" } else { "Active" };

    let mut record = base_record(&svc.metadata, label, health).with_detail("type", svc_type);
    if let Some(ip) = spec.and_then(|s| s.cluster_ip.clone()) {
        record = record.with_detail("clusterIP", ip);
    }
    record
}

pub fn project_node(node: &Node) -> ResourceRecord {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True")
        .unwrap_or(false);
    let cordoned = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);

    let (label, health) = match (ready, cordoned) {
        (true, false) => ("Ready", Health::Healthy),
        (true, true) => ("Ready,SchedulingDisabled", Health::Warning),
        (false, _) => ("NotReady", Health::Error),
    };

    let mut record = base_record(&node.metadata, label, health);
    if let Some(info) = node.status.as_ref().and_then(|s| s.node_info.as_ref()) {
        record = record.with_detail("version", info.kubelet_version.clone());
    }
    record
}

pub fn project_namespace(ns: &Namespace) -> ResourceRecord {
    let phase = ns
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Active".to_string());
    let health = if phase == "Active" {
        Health::Healthy
    } else {
        Health::Warning
    };

    base_record(&ns.metadata, phase, health)
}

// ==================== Storage ====================

pub fn project_pvc(pvc: &PersistentVolumeClaim) -> ResourceRecord {
    let status = pvc.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Pending".to_string());
    let health = match phase.as_str() {
        "Bound" => Health::Healthy,
        "Lost" => Health::Error,
        _ => Health::Warning,
    };

    let mut record = base_record(&pvc.metadata, phase, health);
    if let Some(capacity) = status
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
    {
        record = record.with_detail("capacity", capacity.0.clone());
    }
    if let Some(class) = pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone()) {
        record = record.with_detail("storageClass", class);
    }
    record
}

pub fn project_pv(pv: &PersistentVolume) -> ResourceRecord {
    let phase = pv
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Pending".to_string());
    let health = match phase.as_str() {
        "Bound" | "Available" => Health::Healthy,
        "Failed" => Health::Error,
        _ => Health::Warning,
    };

    let mut record = base_record(&pv.metadata, phase, health);
    if let Some(capacity) = pv
        .spec
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
    {
        record = record.with_detail("capacity", capacity.0.clone());
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> T {
        serde_json::from_value(value).expect("valid fixture")
    }

    #[test]
    fn test_running_ready_pod_is_healthy() {
        let pod: Pod = from_json(json!({
            "metadata": { "name": "web-1", "namespace": "default",
                          "creationTimestamp": "2025-01-02T03:04:05Z" },
            "spec": { "nodeName": "node-a", "containers": [{ "name": "web" }] },
            "status": {
                "phase": "Running",
                "containerStatuses": [{
                    "name": "web", "ready": true, "restartCount": 2,
                    "image": "nginx", "imageID": "",
                    "state": { "running": {} }
                }]
            }
        }));

        let record = project_pod(&pod);
        assert_eq!(record.health, Health::Healthy);
        assert_eq!(record.status, "Running");
        assert_eq!(record.details["ready"], "1/1");
        assert_eq!(record.details["restarts"], "2");
        assert_eq!(record.details["node"], "node-a");
        assert_eq!(record.namespace.as_deref(), Some("default"));
        assert!(record.created_at.is_some());
    }

    #[test]
    fn test_crashlooping_pod_is_error() {
        let pod: Pod = from_json(json!({
            "metadata": { "name": "api", "namespace": "prod" },
            "spec": { "containers": [{ "name": "api" }] },
            "status": {
                "phase": "Running",
                "containerStatuses": [{
                    "name": "api", "ready": false, "restartCount": 7,
                    "image": "api", "imageID": "",
                    "state": { "waiting": { "reason": "CrashLoopBackOff" } }
                }]
            }
        }));

        let record = project_pod(&pod);
        assert_eq!(record.health, Health::Error);
        assert_eq!(record.status, "CrashLoopBackOff");
    }

    #[test]
    fn test_pending_and_unready_pods_are_warnings() {
        let pending: Pod = from_json(json!({
            "metadata": { "name": "p", "namespace": "default" },
            "spec": { "containers": [{ "name": "c" }] },
            "status": { "phase": "Pending" }
        }));
        assert_eq!(project_pod(&pending).health, Health::Warning);

        let unready: Pod = from_json(json!({
            "metadata": { "name": "u", "namespace": "default" },
            "spec": { "containers": [{ "name": "a" }, { "name": "b" }] },
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    { "name": "a", "ready": true, "restartCount": 0, "image": "a", "imageID": "" },
                    { "name": "b", "ready": false, "restartCount": 0, "image": "b", "imageID": "" }
                ]
            }
        }));
        let record = project_pod(&unready);
        assert_eq!(record.health, Health::Warning);
        assert_eq!(record.details["ready"], "1/2");
    }

    #[test]
    fn test_deployment_replica_health() {
        let healthy: Deployment = from_json(json!({
            "metadata": { "name": "web", "namespace": "default" },
            "spec": { "replicas": 3, "selector": {}, "template": {} },
            "status": { "readyReplicas": 3, "availableReplicas": 3 }
        }));
        assert_eq!(project_deployment(&healthy).health, Health::Healthy);

        let degraded: Deployment = from_json(json!({
            "metadata": { "name": "web", "namespace": "default" },
            "spec": { "replicas": 3, "selector": {}, "template": {} },
            "status": { "readyReplicas": 1 }
        }));
        assert_eq!(project_deployment(&degraded).health, Health::Warning);

        let down: Deployment = from_json(json!({
            "metadata": { "name": "web", "namespace": "default" },
            "spec": { "replicas": 2, "selector": {}, "template": {} },
            "status": {}
        }));
        let record = project_deployment(&down);
        assert_eq!(record.health, Health::Error);
        assert_eq!(record.status, "0/2 ready");
    }

    #[test]
    fn test_node_readiness() {
        let cordoned: Node = from_json(json!({
            "metadata": { "name": "n1" },
            "spec": { "unschedulable": true },
            "status": { "conditions": [{ "type": "Ready", "status": "True" }] }
        }));
        let record = project_node(&cordoned);
        assert_eq!(record.health, Health::Warning);
        assert!(record.namespace.is_none());

        let down: Node = from_json(json!({
            "metadata": { "name": "n2" },
            "status": { "conditions": [{ "type": "Ready", "status": "Unknown" }] }
        }));
        assert_eq!(project_node(&down).health, Health::Error);
    }

    #[test]
    fn test_failed_job_and_suspended_cronjob() {
        let job: Job = from_json(json!({
            "metadata": { "name": "migrate", "namespace": "default" },
            "spec": { "template": {} },
            "status": { "failed": 1, "conditions": [{ "type": "Failed", "status": "True" }] }
        }));
        assert_eq!(project_job(&job).health, Health::Error);

        let cron: CronJob = from_json(json!({
            "metadata": { "name": "nightly", "namespace": "default" },
            "spec": { "schedule": "0 3 * * *", "suspend": true, "jobTemplate": {} }
        }));
        let record = project_cronjob(&cron);
        assert_eq!(record.health, Health::Warning);
        assert_eq!(record.details["schedule"], "0 3 * * *");
    }

    #[test]
    fn test_pending_loadbalancer_and_pvc_phases() {
        let svc: Service = from_json(json!({
            "metadata": { "name": "edge", "namespace": "default" },
            "spec": { "type": "LoadBalancer" },
            "status": { "loadBalancer": {} }
        }));
        assert_eq!(project_service(&svc).health, Health::Warning);

        let pvc: PersistentVolumeClaim = from_json(json!({
            "metadata": { "name": "data", "namespace": "default" },
            "status": { "phase": "Lost" }
        }));
        assert_eq!(project_pvc(&pvc).health, Health::Error);
    }
}
