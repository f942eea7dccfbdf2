use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use crafteur_process::ServerStatus;
use tokio::sync::RwLock;

use crate::{
    console::{SubscriberId, Subscription},
    control::ServerControl,
    error::ControlError,
    instance::{Instance, InstanceOptions},
    launch::validate_ram_mb,
    properties::{self, PORT_KEY, Properties},
    sandbox::resolve_in,
};

/// Time allowed for a force-killed process to be reaped during shutdown.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InstanceSummary {
    pub id: String,
    pub status: ServerStatus,
    pub players: Vec<String>,
}

/// All live Instances keyed by server id.
///
/// Structural changes take the write lock; lookups share the read lock and
/// never hold it across an Instance operation.
#[derive(Debug)]
pub struct Registry {
    options: InstanceOptions,
    instances: RwLock<HashMap<String, Arc<Instance>>>,
}

impl Registry {
    pub fn new(options: InstanceOptions) -> Self {
        Self {
            options,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a Stopped instance. An id that is already present is rejected,
    /// so a reload can never shadow a running process.
    pub async fn add_instance(
        &self,
        id: &str,
        run_dir: impl Into<PathBuf>,
        artifact: &str,
    ) -> Result<Arc<Instance>, ControlError> {
        if id.trim().is_empty() {
            return Err(ControlError::validation("id", "must not be empty"));
        }
        let run_dir = run_dir.into();
        resolve_in(&run_dir, artifact)
            .map_err(|e| ControlError::validation("jar_name", e.to_string()))?;

        let mut instances = self.instances.write().await;
        if instances.contains_key(id) {
            return Err(ControlError::AlreadyRegistered(id.to_string()));
        }
        let instance = Arc::new(Instance::new(id, run_dir, artifact, self.options.clone()));
        instances.insert(id.to_string(), instance.clone());
        tracing::info!(server_id = %id, "instance registered");
        Ok(instance)
    }

    pub async fn get_instance(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.read().await.get(id).cloned()
    }

    fn not_found(id: &str) -> ControlError {
        ControlError::ServerNotFound(id.to_string())
    }

    async fn require(&self, id: &str) -> Result<Arc<Instance>, ControlError> {
        self.get_instance(id).await.ok_or_else(|| Self::not_found(id))
    }

    /// Best-effort stop, then drop the entry. Unknown ids are a no-op.
    pub async fn remove_instance(&self, id: &str) {
        let Some(instance) = self.instances.write().await.remove(id) else {
            return;
        };
        if let Err(err) = instance.stop().await {
            tracing::warn!(server_id = %id, error = %err, "stop on removal failed");
        }
        tracing::info!(server_id = %id, "instance removed");
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.instances.read().await.contains_key(id)
    }

    pub async fn list(&self) -> Vec<InstanceSummary> {
        let instances: Vec<Arc<Instance>> = self.instances.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(instances.len());
        for inst in instances {
            out.push(InstanceSummary {
                id: inst.id().to_string(),
                status: inst.status().await,
                players: inst.players().await,
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn start(&self, id: &str) -> Result<(), ControlError> {
        Ok(self.require(id).await?.start().await?)
    }

    pub async fn stop(&self, id: &str) -> Result<(), ControlError> {
        Ok(self.require(id).await?.stop().await?)
    }

    pub async fn kill(&self, id: &str) -> Result<(), ControlError> {
        Ok(self.require(id).await?.kill().await?)
    }

    pub async fn send_command(&self, id: &str, text: &str) -> Result<(), ControlError> {
        Ok(self.require(id).await?.send_command(text).await?)
    }

    pub async fn subscribe(&self, id: &str) -> Result<Subscription, ControlError> {
        Ok(self.require(id).await?.subscribe().await)
    }

    pub async fn unsubscribe(&self, id: &str, subscriber: SubscriberId) -> Result<bool, ControlError> {
        Ok(self.require(id).await?.unsubscribe(subscriber).await)
    }

    pub async fn attach_console(&self, id: &str) -> Result<(Vec<String>, Subscription), ControlError> {
        Ok(self.require(id).await?.attach_console().await)
    }

    pub async fn history(&self, id: &str) -> Result<Vec<String>, ControlError> {
        Ok(self.require(id).await?.history().await)
    }

    pub async fn set_ram(&self, id: &str, mb: u32) -> Result<(), ControlError> {
        let instance = self.require(id).await?;
        let mb = validate_ram_mb(mb).map_err(|msg| ControlError::validation("ram_mb", msg))?;
        instance.set_ram(mb).await;
        Ok(())
    }

    fn properties_path(instance: &Instance) -> PathBuf {
        instance.run_dir().join(properties::FILE_NAME)
    }

    pub async fn properties(&self, id: &str) -> Result<Properties, ControlError> {
        let instance = self.require(id).await?;
        properties::load(&Self::properties_path(&instance))
            .await
            .map_err(ControlError::Properties)
    }

    /// Merges `updates` into the server's property file. Nothing is written if validation fails.
    pub async fn update_properties(&self, id: &str, updates: Properties) -> Result<Properties, ControlError> {
        let instance = self.require(id).await?;
        if let Some(port) = updates.get(PORT_KEY) {
            properties::validate_port(port).map_err(|msg| ControlError::validation(PORT_KEY, msg))?;
        }

        let path = Self::properties_path(&instance);
        let mut props = properties::load(&path).await.map_err(ControlError::Properties)?;
        props.extend(updates);
        properties::save(&path, &props)
            .await
            .map_err(ControlError::Properties)?;
        Ok(props)
    }

    /// Stops every instance, waits up to `grace` for each to exit, then force kills the rest.
    pub async fn shutdown(&self, grace: Duration) {
        let instances: Vec<Arc<Instance>> = self.instances.read().await.values().cloned().collect();

        for inst in &instances {
            if let Err(err) = inst.stop().await {
                tracing::warn!(server_id = %inst.id(), error = %err, "stop during shutdown failed");
            }
        }

        let waits = instances.iter().map(|inst| {
            let inst = inst.clone();
            tokio::spawn(async move {
                if inst.wait_for_status(ServerStatus::Stopped, grace).await {
                    return;
                }
                tracing::warn!(server_id = %inst.id(), "server did not stop in time; killing");
                if let Err(err) = inst.kill().await {
                    tracing::warn!(server_id = %inst.id(), error = %err, "kill failed");
                }
                if !inst.wait_for_status(ServerStatus::Stopped, KILL_REAP_TIMEOUT).await {
                    tracing::error!(server_id = %inst.id(), "server still alive after kill");
                }
            })
        });
        let waits: Vec<_> = waits.collect();
        for w in waits {
            if let Err(err) = w.await {
                tracing::warn!(error = %err, "shutdown wait task failed");
            }
        }
    }
}

#[async_trait]
impl ServerControl for Registry {
    async fn start(&self, server_id: &str) -> Result<(), ControlError> {
        Registry::start(self, server_id).await
    }

    async fn stop(&self, server_id: &str) -> Result<(), ControlError> {
        Registry::stop(self, server_id).await
    }

    async fn send_command(&self, server_id: &str, text: &str) -> Result<(), ControlError> {
        Registry::send_command(self, server_id, text).await
    }
}

/// Directory holding one server's files under the servers root.
pub fn server_dir(servers_root: &Path, id: &str) -> Result<PathBuf, ControlError> {
    resolve_in(servers_root, id).map_err(|e| ControlError::validation("id", e.to_string()))
}

#[cfg(test)]
mod tests {
    use crate::{error::InstanceError, launch::JvmArgs};

    use super::*;

    fn registry() -> Registry {
        Registry::new(InstanceOptions::default())
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        let first = reg.add_instance("s1", dir.path(), "server.jar").await.unwrap();

        let err = reg.add_instance("s1", dir.path(), "other.jar").await.unwrap_err();
        assert!(matches!(err, ControlError::AlreadyRegistered(ref id) if id == "s1"));
        let current = reg.get_instance("s1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &current));
    }

    #[tokio::test]
    async fn artifact_must_stay_inside_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        let err = reg
            .add_instance("s1", dir.path(), "../escape.jar")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation { field: "jar_name", .. }));
        assert!(!reg.contains("s1").await);
    }

    #[tokio::test]
    async fn unknown_ids_surface_not_found() {
        let reg = registry();
        assert!(reg.get_instance("nope").await.is_none());
        for err in [
            reg.start("nope").await.unwrap_err(),
            reg.stop("nope").await.unwrap_err(),
            reg.send_command("nope", "say hi").await.unwrap_err(),
            reg.set_ram("nope", 2048).await.unwrap_err(),
            reg.history("nope").await.unwrap_err(),
            reg.subscribe("nope").await.unwrap_err(),
        ] {
            assert!(matches!(err, ControlError::ServerNotFound(ref id) if id == "nope"));
        }
        // Removing an unknown id is a no-op.
        reg.remove_instance("nope").await;
    }

    #[tokio::test]
    async fn state_errors_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        reg.add_instance("s1", dir.path(), "server.jar").await.unwrap();

        let err = reg.send_command("s1", "list").await.unwrap_err();
        assert!(matches!(err, ControlError::Instance(InstanceError::NotRunning)));
        assert_eq!(err.code(), "state_conflict");
        reg.stop("s1").await.unwrap();
    }

    #[tokio::test]
    async fn set_ram_validates_and_updates_args() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        let inst = reg.add_instance("s1", dir.path(), "server.jar").await.unwrap();

        let err = reg.set_ram("s1", 64).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation { field: "ram_mb", .. }));
        assert_eq!(inst.jvm_args().await, JvmArgs::default());

        reg.set_ram("s1", 2048).await.unwrap();
        assert_eq!(inst.jvm_args().await.as_slice(), ["-Xmx2048M", "-Xms2048M"]);
    }

    #[tokio::test]
    async fn list_is_sorted_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        reg.add_instance("b", dir.path(), "server.jar").await.unwrap();
        reg.add_instance("a", dir.path(), "server.jar").await.unwrap();

        let list = reg.list().await;
        let ids: Vec<&str> = list.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(list.iter().all(|s| s.status == ServerStatus::Stopped));

        reg.remove_instance("a").await;
        assert!(!reg.contains("a").await);
        assert_eq!(reg.list().await.len(), 1);
    }

    #[tokio::test]
    async fn property_updates_validate_port_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        reg.add_instance("s1", dir.path(), "server.jar").await.unwrap();
        assert!(reg.properties("s1").await.unwrap().is_empty());

        let mut bad = Properties::new();
        bad.insert(PORT_KEY.to_string(), "80".to_string());
        bad.insert("motd".to_string(), "hi".to_string());
        let err = reg.update_properties("s1", bad).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation { field: PORT_KEY, .. }));
        assert!(!dir.path().join(properties::FILE_NAME).exists());

        let mut good = Properties::new();
        good.insert(PORT_KEY.to_string(), "25570".to_string());
        reg.update_properties("s1", good).await.unwrap();
        let mut more = Properties::new();
        more.insert("motd".to_string(), "hello".to_string());
        let merged = reg.update_properties("s1", more).await.unwrap();
        assert_eq!(merged[PORT_KEY], "25570");
        assert_eq!(reg.properties("s1").await.unwrap(), merged);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_kills_servers_that_ignore_stop() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("stubborn.sh");
        std::fs::write(&script, "while IFS= read -r line; do echo \"ignored $line\"; done\n").unwrap();
        let options = InstanceOptions {
            java_bin: "/bin/sh".to_string(),
            ..InstanceOptions::default()
        };
        let reg = Registry::new(options.clone());
        let inst = Arc::new(
            Instance::new("s1", dir.path(), "server.jar", options)
                .with_jvm_args(JvmArgs::new(vec![script.display().to_string()])),
        );
        reg.instances.write().await.insert("s1".to_string(), inst.clone());

        reg.start("s1").await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(10),
            reg.shutdown(Duration::from_millis(500)),
        )
        .await
        .expect("shutdown did not finish");
        assert_eq!(inst.status().await, ServerStatus::Stopped);
        assert!(inst.history().await.iter().any(|l| l == "ignored stop"));
    }

    #[test]
    fn server_dir_rejects_traversal() {
        let root = Path::new("/srv/servers");
        assert_eq!(server_dir(root, "abc").unwrap(), root.join("abc"));
        assert!(server_dir(root, "../etc").is_err());
    }
}
